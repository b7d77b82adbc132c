//! Polymorphic site adapters
//!
//! Every variant exposes the same five operations and produces the
//! normalized shapes in [`vod`]. Variants never fail on missing optional
//! fields; they fail with `ParseError` only when a source payload is
//! structurally unusable.

pub mod alist;
pub mod cms;
pub mod manager;
pub mod script;
pub mod vod;
pub mod xpath;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Site;
use crate::error::Result;
use crate::fetcher::Fetcher;

pub use manager::{SpiderHandle, SpiderKind, SpiderManager, SpiderStatus};
pub use vod::{CategoryPage, HomeContent, PlayResult, Vod, VodList};

/// Shared construction context for spider variants.
#[derive(Clone)]
pub struct SpiderCtx {
    pub site: Site,
    pub fetcher: Arc<Fetcher>,
}

impl SpiderCtx {
    pub fn new(site: Site, fetcher: Arc<Fetcher>) -> Self {
        Self { site, fetcher }
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.site.headers()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.site.timeout_ms())
    }
}

/// The five-operation site adapter contract.
#[async_trait]
pub trait Spider: Send + Sync {
    async fn home_content(&self, filter: bool, cancel: &CancellationToken) -> Result<HomeContent>;

    async fn category_content(
        &self,
        tid: &str,
        pg: u32,
        filter: bool,
        extend: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CategoryPage>;

    async fn detail_content(&self, ids: &[String], cancel: &CancellationToken) -> Result<VodList>;

    async fn search_content(
        &self,
        key: &str,
        quick: bool,
        cancel: &CancellationToken,
    ) -> Result<VodList>;

    async fn player_content(
        &self,
        flag: &str,
        id: &str,
        vip_flags: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlayResult>;

    /// False once the spider's backing runtime is unusable; the manager
    /// evicts dead spiders.
    fn alive(&self) -> bool {
        true
    }

    async fn destroy(&self) {}
}

/// Placeholder record returned when a script does not implement search.
pub fn default_search_result(query: &str) -> VodList {
    let mut vod = Vod::new(query, query);
    vod.remarks = "暂无搜索结果".to_string();
    VodList { list: vec![vod] }
}

/// Degraded spider: every operation yields an empty result.
pub struct NullSpider;

#[async_trait]
impl Spider for NullSpider {
    async fn home_content(&self, _filter: bool, _cancel: &CancellationToken) -> Result<HomeContent> {
        Ok(HomeContent::default())
    }

    async fn category_content(
        &self,
        _tid: &str,
        _pg: u32,
        _filter: bool,
        _extend: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<CategoryPage> {
        Ok(CategoryPage::default())
    }

    async fn detail_content(&self, _ids: &[String], _cancel: &CancellationToken) -> Result<VodList> {
        Ok(VodList::default())
    }

    async fn search_content(
        &self,
        _key: &str,
        _quick: bool,
        _cancel: &CancellationToken,
    ) -> Result<VodList> {
        Ok(VodList::default())
    }

    async fn player_content(
        &self,
        _flag: &str,
        _id: &str,
        _vip_flags: &[String],
        _cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        Ok(PlayResult::default())
    }
}

/// Media extensions treated as directly playable.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "3gp", "ts", "m3u8",
];

/// Whether a URL path ends in a known media extension.
pub fn is_media_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    path.contains('.') && VIDEO_EXTENSIONS.contains(&ext.as_str())
}
