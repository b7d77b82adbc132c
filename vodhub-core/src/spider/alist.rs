//! Alist file-listing spider
//!
//! Treats an Alist deployment as a site: folders become categories and
//! synthesized vods, video files become episodes, and direct play URLs come
//! from `raw_url` or the `/d/<path>` download route.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::vod::{CategoryPage, Episode, HomeContent, PlayResult, PlaySource, Vod, VodList};
use super::{Spider, SpiderCtx, VIDEO_EXTENSIONS};
use crate::config::Category;
use crate::error::{Error, Result};
use crate::fetcher::FetchRequest;

const PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
struct AlistResp<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct FsListData {
    #[serde(default)]
    content: Option<Vec<FsNode>>,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct FsNode {
    name: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    sign: String,
}

#[derive(Debug, Default, Deserialize)]
struct FsGetData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    raw_url: String,
    #[serde(default)]
    sign: String,
}

#[derive(Debug, Default, Deserialize)]
struct FsSearchData {
    #[serde(default)]
    content: Option<Vec<SearchNode>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchNode {
    #[serde(default)]
    parent: String,
    name: String,
    #[serde(default)]
    is_dir: bool,
}

/// Per-site options carried in `ext`.
#[derive(Debug, Default, Deserialize)]
struct AlistExt {
    #[serde(default)]
    token: String,
    #[serde(default)]
    password: String,
}

pub struct AlistSpider {
    ctx: SpiderCtx,
    host: String,
    ext: AlistExt,
}

fn is_video_name(name: &str) -> bool {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    name.contains('.') && VIDEO_EXTENSIONS.contains(&ext.as_str())
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

impl AlistSpider {
    pub fn new(ctx: SpiderCtx) -> Self {
        let host = ctx.site.api_url.trim_end_matches('/').to_string();
        let ext = ctx
            .site
            .ext
            .as_ref()
            .and_then(|e| e.as_object())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Self { ctx, host, ext }
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut headers = self.ctx.headers();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if !self.ext.token.is_empty() {
            headers.insert("Authorization".to_string(), self.ext.token.clone());
        }
        headers
    }

    async fn api_post<T: DeserializeOwned>(
        &self,
        route: &str,
        body: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let url = format!("{}{route}", self.host);
        let mut request = FetchRequest::get(&url)
            .with_headers(self.headers())
            .with_timeout(self.ctx.timeout());
        request.method = http::Method::POST;
        request.body = Some(Bytes::from(body.to_string().into_bytes()));

        let resp = self.ctx.fetcher.fetch(request, cancel).await?;
        let envelope: AlistResp<T> = resp.json()?;
        if envelope.code != 200 {
            return Err(Error::Parse(format!(
                "alist {route} failed with code {}: {}",
                envelope.code, envelope.message
            )));
        }
        envelope
            .data
            .ok_or_else(|| Error::Parse(format!("alist {route} returned no data")))
    }

    async fn fs_list(&self, path: &str, page: u32, cancel: &CancellationToken) -> Result<FsListData> {
        self.api_post(
            "/api/fs/list",
            json!({
                "path": path,
                "password": self.ext.password,
                "page": page,
                "per_page": PER_PAGE,
                "refresh": false,
            }),
            cancel,
        )
        .await
    }

    async fn fs_get(&self, path: &str, cancel: &CancellationToken) -> Result<FsGetData> {
        self.api_post(
            "/api/fs/get",
            json!({ "path": path, "password": self.ext.password }),
            cancel,
        )
        .await
    }

    fn node_to_vod(&self, parent: &str, node: &FsNode) -> Vod {
        let mut vod = Vod::new(join_path(parent, &node.name), node.name.clone());
        vod.remarks = if node.is_dir { "文件夹" } else { "视频" }.to_string();
        vod.site_key = self.ctx.site.key.clone();
        vod
    }

    fn direct_url(&self, path: &str, sign: &str) -> String {
        let encoded: String = path
            .split('/')
            .map(|seg| {
                percent_encoding::utf8_percent_encode(seg, percent_encoding::NON_ALPHANUMERIC)
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("/");
        if sign.is_empty() {
            format!("{}/d{encoded}", self.host)
        } else {
            format!("{}/d{encoded}?sign={sign}", self.host)
        }
    }
}

#[async_trait]
impl Spider for AlistSpider {
    async fn home_content(&self, _filter: bool, cancel: &CancellationToken) -> Result<HomeContent> {
        let listing = self.fs_list("/", 1, cancel).await?;
        let class = listing
            .content
            .unwrap_or_default()
            .iter()
            .filter(|n| n.is_dir)
            .map(|n| Category {
                id: format!("/{}", n.name),
                name: n.name.clone(),
                flag: String::new(),
            })
            .collect();
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
        let pg = pg.max(1);
        let listing = self.fs_list(tid, pg, cancel).await?;
        let total = listing.total;
        let list: Vec<Vod> = listing
            .content
            .unwrap_or_default()
            .iter()
            .filter(|n| n.is_dir || is_video_name(&n.name))
            .map(|n| self.node_to_vod(tid, n))
            .collect();

        Ok(CategoryPage {
            list,
            page: pg,
            pagecount: ((total + u64::from(PER_PAGE) - 1) / u64::from(PER_PAGE)).max(1) as u32,
            limit: PER_PAGE,
            total: total as u32,
        })
    }

    async fn detail_content(&self, ids: &[String], cancel: &CancellationToken) -> Result<VodList> {
        let Some(path) = ids.first() else {
            return Ok(VodList::default());
        };

        let info = self.fs_get(path, cancel).await?;
        let episodes: Vec<Episode> = if info.is_dir {
            self.fs_list(path, 1, cancel)
                .await?
                .content
                .unwrap_or_default()
                .iter()
                .filter(|n| !n.is_dir && is_video_name(&n.name))
                .map(|n| Episode {
                    name: n.name.clone(),
                    url: join_path(path, &n.name),
                })
                .collect()
        } else {
            vec![Episode {
                name: info.name.clone(),
                url: path.clone(),
            }]
        };

        let mut vod = Vod::new(path.clone(), if info.name.is_empty() {
            path.rsplit('/').next().unwrap_or(path).to_string()
        } else {
            info.name
        });
        vod.site_key = self.ctx.site.key.clone();
        vod.set_play_sources(&[PlaySource {
            name: self.ctx.site.name.clone(),
            episodes,
        }]);
        Ok(VodList { list: vec![vod] })
    }

    async fn search_content(
        &self,
        key: &str,
        quick: bool,
        cancel: &CancellationToken,
    ) -> Result<VodList> {
        if key.trim().is_empty() {
            return Ok(VodList::default());
        }
        let timeout = if quick {
            self.ctx.timeout() / 2
        } else {
            self.ctx.timeout()
        };
        let url = format!("{}/api/fs/search", self.host);
        let mut request = FetchRequest::get(&url)
            .with_headers(self.headers())
            .with_timeout(timeout);
        request.method = http::Method::POST;
        request.body = Some(Bytes::from(
            json!({
                "keywords": key,
                "parent": "/",
                "scope": 0,
                "page": 1,
                "per_page": PER_PAGE,
                "password": self.ext.password,
            })
            .to_string()
            .into_bytes(),
        ));

        let resp = self.ctx.fetcher.fetch(request, cancel).await?;
        let envelope: AlistResp<FsSearchData> = resp.json()?;
        if envelope.code != 200 {
            return Err(Error::Parse(format!(
                "alist search failed with code {}: {}",
                envelope.code, envelope.message
            )));
        }

        let list = envelope
            .data
            .unwrap_or_default()
            .content
            .unwrap_or_default()
            .iter()
            .filter(|n| n.is_dir || is_video_name(&n.name))
            .map(|n| {
                let mut vod = Vod::new(join_path(&n.parent, &n.name), n.name.clone());
                vod.remarks = if n.is_dir { "文件夹" } else { "视频" }.to_string();
                vod.site_key = self.ctx.site.key.clone();
                vod
            })
            .collect();
        Ok(VodList { list })
    }

    async fn player_content(
        &self,
        flag: &str,
        id: &str,
        _vip_flags: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        // Prefer the storage's own raw URL; fall back to the download route.
        let url = match self.fs_get(id, cancel).await {
            Ok(info) if !info.raw_url.is_empty() => info.raw_url,
            Ok(info) => self.direct_url(id, &info.sign),
            Err(_) => self.direct_url(id, ""),
        };
        let mut result = PlayResult::direct(url);
        result.flag = flag.to_string();
        result.headers = self.ctx.headers();
        Ok(result)
    }
}
