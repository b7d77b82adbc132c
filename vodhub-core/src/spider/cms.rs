//! CMS (vendor JSON API) spider
//!
//! Speaks the standard provide-vod contract:
//!   `?ac=list&t=<tid>&pg=<pg>&f=<filters>` — category page
//!   `?ac=detail&ids=<ids>`                 — detail records
//!   `?ac=list&wd=<q>&pg=<pg>`              — search
//! A bare GET on the api URL answers with the home class list.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::vod::{CategoryPage, HomeContent, PlayResult, Vod, VodList};
use super::{is_media_url, Spider, SpiderCtx};
use crate::config::Category;
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct CmsEnvelope {
    #[serde(default)]
    class: Vec<Category>,
    #[serde(default)]
    list: Vec<Vod>,
    #[serde(default)]
    page: Option<serde_json::Value>,
    #[serde(default)]
    pagecount: Option<serde_json::Value>,
    #[serde(default)]
    limit: Option<serde_json::Value>,
    #[serde(default)]
    total: Option<serde_json::Value>,
    #[serde(default)]
    filters: Option<serde_json::Value>,
}

fn as_u32(value: &Option<serde_json::Value>) -> u32 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub struct CmsSpider {
    ctx: SpiderCtx,
}

impl CmsSpider {
    pub fn new(ctx: SpiderCtx) -> Self {
        Self { ctx }
    }

    fn build_url(&self, params: &[(&str, String)]) -> String {
        let api = &self.ctx.site.api_url;
        if params.is_empty() {
            return api.clone();
        }
        let query = serde_urlencoded::to_string(params).unwrap_or_default();
        if api.contains('?') {
            format!("{api}&{query}")
        } else {
            format!("{api}?{query}")
        }
    }

    async fn request(&self, params: &[(&str, String)], cancel: &CancellationToken) -> Result<CmsEnvelope> {
        let url = self.build_url(params);
        let text = self
            .ctx
            .fetcher
            .get_text(&url, self.ctx.headers(), self.ctx.timeout(), cancel)
            .await?;
        if text.trim().is_empty() {
            return Err(Error::Parse(format!("empty CMS payload from {url}")));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("CMS payload unparseable from {url}: {e}")))
    }

    fn stamp(&self, mut vods: Vec<Vod>) -> Vec<Vod> {
        for vod in &mut vods {
            vod.site_key = self.ctx.site.key.clone();
        }
        vods
    }
}

#[async_trait]
impl Spider for CmsSpider {
    async fn home_content(&self, filter: bool, cancel: &CancellationToken) -> Result<HomeContent> {
        let envelope = self.request(&[], cancel).await?;

        // Configured categories act as an ordered allow-list.
        let configured = &self.ctx.site.categories;
        let class = if configured.is_empty() {
            envelope.class
        } else {
            configured
                .iter()
                .filter_map(|want| {
                    envelope
                        .class
                        .iter()
                        .find(|c| c.name == want.name || c.id == want.id)
                        .cloned()
                })
                .collect()
        };

        Ok(HomeContent {
            class,
            list: self.stamp(envelope.list),
            filters: if filter { envelope.filters } else { None },
        })
    }

    async fn category_content(
        &self,
        tid: &str,
        pg: u32,
        filter: bool,
        extend: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CategoryPage> {
        let mut params = vec![
            ("ac", "list".to_string()),
            ("t", tid.to_string()),
            ("pg", pg.to_string()),
        ];
        if filter && !extend.is_empty() {
            params.push(("f", serde_json::to_string(extend)?));
        }

        let envelope = self.request(&params, cancel).await?;
        let pagecount = as_u32(&envelope.pagecount);

        // Past the last page the list is empty but the counters hold.
        let list = if pagecount > 0 && pg > pagecount {
            Vec::new()
        } else {
            envelope.list
        };

        let page = match as_u32(&envelope.page) {
            0 => pg,
            reported => reported,
        };
        Ok(CategoryPage {
            list: self.stamp(list),
            page,
            pagecount,
            limit: as_u32(&envelope.limit),
            total: as_u32(&envelope.total),
        })
    }

    async fn detail_content(&self, ids: &[String], cancel: &CancellationToken) -> Result<VodList> {
        if ids.is_empty() {
            return Ok(VodList::default());
        }
        let envelope = self
            .request(
                &[("ac", "detail".to_string()), ("ids", ids.join(","))],
                cancel,
            )
            .await?;
        Ok(VodList {
            list: self.stamp(envelope.list),
        })
    }

    async fn search_content(
        &self,
        key: &str,
        _quick: bool,
        cancel: &CancellationToken,
    ) -> Result<VodList> {
        if key.trim().is_empty() {
            return Ok(VodList::default());
        }
        let envelope = self
            .request(
                &[
                    ("ac", "list".to_string()),
                    ("wd", key.to_string()),
                    ("pg", "1".to_string()),
                ],
                cancel,
            )
            .await?;
        Ok(VodList {
            list: self.stamp(envelope.list),
        })
    }

    async fn player_content(
        &self,
        flag: &str,
        id: &str,
        _vip_flags: &[String],
        _cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        // CMS episode ids are URLs. Only a known media extension plays
        // as-is; page URLs still need a parser pass.
        if is_media_url(id) {
            return Ok(PlayResult::direct(id));
        }
        Ok(PlayResult::needs_parser(id, flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Site;
    use crate::fetcher::{Fetcher, FetcherConfig};
    use axum::extract::Query;
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn spider(api: String) -> CmsSpider {
        let site: Site = serde_json::from_value(serde_json::json!({
            "key": "demo",
            "name": "Demo",
            "type": 1,
            "api": api,
        }))
        .expect("site");
        CmsSpider::new(SpiderCtx::new(
            site,
            Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher")),
        ))
    }

    async fn cms_fixture() -> String {
        let router = Router::new().route(
            "/api.php/provide/vod/",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let body = match params.get("ac").map(String::as_str) {
                    None => serde_json::json!({
                        "class": [
                            {"type_id": "1", "type_name": "电影"},
                            {"type_id": "2", "type_name": "电视剧"}
                        ]
                    }),
                    Some("list") if params.contains_key("wd") => serde_json::json!({
                        "list": [{"vod_id": "s1", "vod_name": params["wd"]}]
                    }),
                    Some("list") => serde_json::json!({
                        "list": if params.get("pg").map(String::as_str) == Some("9") {
                            serde_json::json!([])
                        } else {
                            serde_json::json!([{"vod_id": "42", "vod_name": "X"}])
                        },
                        "page": params.get("pg").cloned().unwrap_or_default(),
                        "pagecount": 5,
                        "limit": "20",
                        "total": 100
                    }),
                    Some("detail") => serde_json::json!({
                        "list": [{
                            "vod_id": params.get("ids").cloned().unwrap_or_default(),
                            "vod_name": "Detail",
                            "vod_play_from": "A$$$B",
                            "vod_play_url": "1$u1#2$u2$$$1$v1"
                        }]
                    }),
                    _ => serde_json::json!({}),
                };
                axum::Json(body)
            }),
        );
        let base = serve(router).await;
        format!("{base}/api.php/provide/vod/")
    }

    #[tokio::test]
    async fn home_returns_class_list() {
        let spider = spider(cms_fixture().await);
        let home = spider
            .home_content(false, &CancellationToken::new())
            .await
            .expect("home");
        assert_eq!(home.class.len(), 2);
        assert_eq!(home.class[0].id, "1");
        assert_eq!(home.class[0].name, "电影");
    }

    #[tokio::test]
    async fn category_page_normalizes_counters() {
        let spider = spider(cms_fixture().await);
        let page = spider
            .category_content("1", 2, false, &HashMap::new(), &CancellationToken::new())
            .await
            .expect("category");
        assert_eq!(page.list.len(), 1);
        assert_eq!(page.list[0].id, "42");
        assert_eq!(page.list[0].site_key, "demo");
        assert_eq!(page.page, 2);
        assert_eq!(page.pagecount, 5);
        assert_eq!(page.limit, 20);
        assert_eq!(page.total, 100);
    }

    #[tokio::test]
    async fn page_past_the_end_is_empty_with_same_pagecount() {
        let spider = spider(cms_fixture().await);
        let page = spider
            .category_content("1", 9, false, &HashMap::new(), &CancellationToken::new())
            .await
            .expect("category");
        assert!(page.list.is_empty());
        assert_eq!(page.pagecount, 5);
    }

    #[tokio::test]
    async fn empty_search_does_no_io() {
        let spider = spider("http://127.0.0.1:1/unreachable".to_string());
        let result = spider
            .search_content("  ", false, &CancellationToken::new())
            .await
            .expect("search");
        assert!(result.list.is_empty());
    }

    #[tokio::test]
    async fn detail_round_trips_play_sources() {
        let spider = spider(cms_fixture().await);
        let detail = spider
            .detail_content(&["42".to_string()], &CancellationToken::new())
            .await
            .expect("detail");
        let vod = &detail.list[0];
        let sources = vod.play_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].episodes.len(), 2);
        assert_eq!(
            vod.play_from.split("$$$").count(),
            vod.play_url.split("$$$").count()
        );
    }

    #[tokio::test]
    async fn direct_media_id_plays_without_parser() {
        let spider = spider("http://unused.example/".to_string());
        let play = spider
            .player_content("hd", "https://x/stream.m3u8", &[], &CancellationToken::new())
            .await
            .expect("play");
        assert_eq!(play.parse, 0);
        assert_eq!(play.url, "https://x/stream.m3u8");
    }

    #[tokio::test]
    async fn page_url_id_still_needs_a_parser() {
        let spider = spider("http://unused.example/".to_string());
        let play = spider
            .player_content(
                "hd",
                "https://site.example/play/ep1",
                &[],
                &CancellationToken::new(),
            )
            .await
            .expect("play");
        assert_eq!(play.parse, 1);
        assert_eq!(play.url, "https://site.example/play/ep1");
        assert_eq!(play.flag, "hd");
    }
}
