//! Selector-configured HTML spider
//!
//! The site's `ext` object declares page-URL templates and `sel&&sel&&Attr`
//! rules (the same rule grammar the script bridges expose as `pdfh`/`pdfa`).
//! Operations fetch HTML through the shared fetcher and evaluate the rules;
//! missing rules degrade to empty fields, never to errors.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::vod::{CategoryPage, Episode, HomeContent, PlayResult, PlaySource, Vod, VodList};
use super::{is_media_url, Spider, SpiderCtx};
use crate::config::Category;
use crate::error::{Error, Result};
use crate::script::bridge::{join_url, select_all, select_first};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct XPathConfig {
    /// Category page template with `{cateId}` and `{catePg}` placeholders.
    pub cate_url: String,
    /// Search template with a `{wd}` placeholder; empty means unsearchable.
    pub search_url: String,
    /// Detail template with a `{vid}` placeholder; empty means the vod id
    /// already is the detail URL.
    pub detail_url: String,
    pub classes: Vec<Category>,
    /// Item rules.
    pub list: String,
    pub name: String,
    pub pic: String,
    pub url: String,
    pub remarks: String,
    /// Optional rule yielding the page count.
    pub pagecount: String,
    pub detail: XPathDetailConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct XPathDetailConfig {
    pub name: String,
    pub year: String,
    pub area: String,
    pub actor: String,
    pub director: String,
    pub content: String,
    /// Rule yielding source tab names; empty collapses to one source.
    pub from: String,
    pub ep_name: String,
    pub ep_url: String,
}

pub struct XPathSpider {
    ctx: SpiderCtx,
    config: XPathConfig,
}

impl XPathSpider {
    pub fn new(ctx: SpiderCtx) -> Result<Self> {
        let ext = ctx
            .site
            .ext
            .as_ref()
            .and_then(|e| e.as_object())
            .ok_or_else(|| {
                Error::Config(format!("site {} has no selector config", ctx.site.key))
            })?;
        let config: XPathConfig = serde_json::from_value(ext.clone())
            .map_err(|e| Error::Config(format!("bad selector config for {}: {e}", ctx.site.key)))?;
        if config.list.is_empty() || config.cate_url.is_empty() {
            return Err(Error::Config(format!(
                "selector config for {} needs cateUrl and list rules",
                ctx.site.key
            )));
        }
        Ok(Self { ctx, config })
    }

    async fn fetch_html(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let html = self
            .ctx
            .fetcher
            .get_text(url, self.ctx.headers(), self.ctx.timeout(), cancel)
            .await?;
        if html.trim().is_empty() {
            return Err(Error::Parse(format!("empty HTML from {url}")));
        }
        Ok(html)
    }

    fn extract_items(&self, html: &str) -> Vec<Vod> {
        select_all(html, &self.config.list)
            .into_iter()
            .filter_map(|fragment| {
                let link = select_first(&fragment, &self.config.url);
                if link.is_empty() {
                    return None;
                }
                let mut vod = Vod::new(
                    join_url(&self.ctx.site.api_url, &link),
                    select_first(&fragment, &self.config.name),
                );
                if !self.config.pic.is_empty() {
                    vod.pic = join_url(
                        &self.ctx.site.api_url,
                        &select_first(&fragment, &self.config.pic),
                    );
                }
                if !self.config.remarks.is_empty() {
                    vod.remarks = select_first(&fragment, &self.config.remarks);
                }
                vod.site_key = self.ctx.site.key.clone();
                Some(vod)
            })
            .collect()
    }

    fn page_count(&self, html: &str, pg: u32, has_items: bool) -> u32 {
        if !self.config.pagecount.is_empty() {
            let text = select_first(html, &self.config.pagecount);
            let digits: String = text.chars().filter(char::is_ascii_digit).collect();
            if let Ok(count) = digits.parse() {
                return count;
            }
        }
        // Without a rule, assume one more page while items keep coming.
        if has_items {
            pg + 1
        } else {
            pg.saturating_sub(1).max(1)
        }
    }
}

#[async_trait]
impl Spider for XPathSpider {
    async fn home_content(&self, _filter: bool, _cancel: &CancellationToken) -> Result<HomeContent> {
        let class = if self.config.classes.is_empty() {
            self.ctx.site.categories.clone()
        } else {
            self.config.classes.clone()
        };
        Ok(HomeContent {
            class,
            ..HomeContent::default()
        })
    }

    async fn category_content(
        &self,
        tid: &str,
        pg: u32,
        _filter: bool,
        _extend: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CategoryPage> {
        let url = self
            .config
            .cate_url
            .replace("{cateId}", tid)
            .replace("{catePg}", &pg.to_string());
        let html = self.fetch_html(&url, cancel).await?;
        let list = self.extract_items(&html);
        let pagecount = self.page_count(&html, pg, !list.is_empty());
        Ok(CategoryPage {
            list,
            page: pg,
            pagecount,
            limit: 0,
            total: 0,
        })
    }

    async fn detail_content(&self, ids: &[String], cancel: &CancellationToken) -> Result<VodList> {
        let Some(id) = ids.first() else {
            return Ok(VodList::default());
        };
        let url = if self.config.detail_url.is_empty() {
            id.clone()
        } else {
            self.config.detail_url.replace("{vid}", id)
        };
        let html = self.fetch_html(&url, cancel).await?;

        let detail = &self.config.detail;
        let mut vod = Vod::new(id.clone(), select_first(&html, &detail.name));
        vod.year = select_first(&html, &detail.year);
        vod.area = select_first(&html, &detail.area);
        vod.actor = select_first(&html, &detail.actor);
        vod.director = select_first(&html, &detail.director);
        vod.content = select_first(&html, &detail.content);
        vod.site_key = self.ctx.site.key.clone();

        let names = select_all(&html, &detail.ep_name);
        let urls = select_all(&html, &detail.ep_url);
        let episodes: Vec<Episode> = urls
            .iter()
            .enumerate()
            .map(|(i, raw)| Episode {
                name: names.get(i).cloned().unwrap_or_else(|| format!("第{}集", i + 1)),
                url: join_url(&self.ctx.site.api_url, raw),
            })
            .collect();

        let source_names = if detail.from.is_empty() {
            Vec::new()
        } else {
            select_all(&html, &detail.from)
        };
        let sources = if source_names.is_empty() {
            vec![PlaySource {
                name: self.ctx.site.name.clone(),
                episodes,
            }]
        } else {
            // Episode rules select all sources' episodes in document order;
            // split them evenly across the tabs.
            let per_source = (episodes.len() / source_names.len().max(1)).max(1);
            source_names
                .into_iter()
                .enumerate()
                .map(|(i, name)| PlaySource {
                    name,
                    episodes: episodes
                        .iter()
                        .skip(i * per_source)
                        .take(per_source)
                        .cloned()
                        .collect(),
                })
                .collect()
        };
        vod.set_play_sources(&sources);

        Ok(VodList { list: vec![vod] })
    }

    async fn search_content(
        &self,
        key: &str,
        _quick: bool,
        cancel: &CancellationToken,
    ) -> Result<VodList> {
        if key.trim().is_empty() || self.config.search_url.is_empty() {
            return Ok(VodList::default());
        }
        let url = self.config.search_url.replace(
            "{wd}",
            &percent_encoding::utf8_percent_encode(key, percent_encoding::NON_ALPHANUMERIC)
                .to_string(),
        );
        let html = self.fetch_html(&url, cancel).await?;
        Ok(VodList {
            list: self.extract_items(&html),
        })
    }

    async fn player_content(
        &self,
        flag: &str,
        id: &str,
        _vip_flags: &[String],
        _cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        let url = join_url(&self.ctx.site.api_url, id);
        if is_media_url(&url) {
            return Ok(PlayResult::direct(url));
        }
        // HTML sites need the page sniffed or parsed client-side.
        Ok(PlayResult::needs_parser(url, flag))
    }
}
