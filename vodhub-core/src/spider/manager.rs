//! Spider lifecycle manager
//!
//! Owns every live spider, keyed by site. Instances are created lazily, the
//! effective variant is inferred from URL heuristics (the configured type is
//! a hint), and a failed construction degrades the site to a `NullSpider`
//! rather than failing the caller. `destroy_all` runs on config change;
//! operations in flight observe the epoch cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::alist::AlistSpider;
use super::cms::CmsSpider;
use super::script::ScriptSpider;
use super::vod::{CategoryPage, HomeContent, PlayResult, VodList};
use super::xpath::XPathSpider;
use super::{NullSpider, Spider, SpiderCtx};
use crate::config::{Site, SiteType};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::script::{Bridge, ScriptHostFactory};

/// Effective (inferred) spider variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpiderKind {
    Native,
    Cms,
    Xpath,
    Script,
    Alist,
    Null,
}

/// Factory for built-in per-site adapters.
pub type NativeSpiderFactory =
    Arc<dyn Fn(SpiderCtx) -> Result<Arc<dyn Spider>> + Send + Sync>;

/// One registered spider plus its serialization lock.
///
/// Operations on a single spider are serialized; across spiders they run
/// fully parallel. The epoch token aborts in-flight work on config change.
pub struct SpiderHandle {
    pub key: String,
    pub kind: SpiderKind,
    pub degraded: bool,
    spider: Arc<dyn Spider>,
    op_lock: tokio::sync::Mutex<()>,
    epoch_cancel: CancellationToken,
}

impl SpiderHandle {
    fn new(
        key: String,
        kind: SpiderKind,
        degraded: bool,
        spider: Arc<dyn Spider>,
        epoch_cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            kind,
            degraded,
            spider,
            op_lock: tokio::sync::Mutex::new(()),
            epoch_cancel,
        }
    }

    pub fn alive(&self) -> bool {
        self.spider.alive()
    }

    async fn serialized<T>(
        &self,
        op: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let _permit = self.op_lock.lock().await;
        tokio::select! {
            biased;
            () = self.epoch_cancel.cancelled() => Err(Error::Cancelled),
            result = op => result,
        }
    }

    pub async fn home_content(&self, filter: bool, cancel: &CancellationToken) -> Result<HomeContent> {
        self.serialized(self.spider.home_content(filter, cancel)).await
    }

    pub async fn category_content(
        &self,
        tid: &str,
        pg: u32,
        filter: bool,
        extend: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CategoryPage> {
        self.serialized(self.spider.category_content(tid, pg, filter, extend, cancel))
            .await
    }

    pub async fn detail_content(&self, ids: &[String], cancel: &CancellationToken) -> Result<VodList> {
        self.serialized(self.spider.detail_content(ids, cancel)).await
    }

    pub async fn search_content(
        &self,
        key: &str,
        quick: bool,
        cancel: &CancellationToken,
    ) -> Result<VodList> {
        self.serialized(self.spider.search_content(key, quick, cancel)).await
    }

    pub async fn player_content(
        &self,
        flag: &str,
        id: &str,
        vip_flags: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        self.serialized(self.spider.player_content(flag, id, vip_flags, cancel))
            .await
    }
}

/// Status row surfaced for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpiderStatus {
    pub key: String,
    pub kind: SpiderKind,
    pub degraded: bool,
}

pub struct SpiderManager {
    fetcher: Arc<Fetcher>,
    script_factory: Arc<dyn ScriptHostFactory>,
    native_factories: HashMap<String, NativeSpiderFactory>,
    proxy_base: RwLock<String>,
    slots: DashMap<String, Arc<SpiderHandle>>,
    creating: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    epoch_cancel: RwLock<CancellationToken>,
}

impl SpiderManager {
    pub fn new(fetcher: Arc<Fetcher>, script_factory: Arc<dyn ScriptHostFactory>) -> Self {
        Self {
            fetcher,
            script_factory,
            native_factories: HashMap::new(),
            proxy_base: RwLock::new(String::new()),
            slots: DashMap::new(),
            creating: DashMap::new(),
            epoch_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Register a built-in adapter for a site key.
    pub fn with_native(
        mut self,
        site_key: &str,
        factory: NativeSpiderFactory,
    ) -> Self {
        self.native_factories.insert(site_key.to_string(), factory);
        self
    }

    pub fn set_proxy_base(&self, base: String) {
        *self.proxy_base.write() = base;
    }

    /// Infer the effective variant, even when the configured type disagrees.
    pub fn infer_kind(site: &Site) -> SpiderKind {
        let api = site.api_url.to_lowercase();
        if api.contains(".js") || api.contains("drpy") || api.contains("hipy") {
            return SpiderKind::Script;
        }
        if site.jar.as_deref().is_some_and(|j| !j.is_empty()) || api.contains(".jar") {
            return SpiderKind::Native;
        }
        if api.starts_with("csp_") || api.contains("spider") {
            return SpiderKind::Native;
        }
        if site.site_type == SiteType::Alist {
            return SpiderKind::Alist;
        }
        if site.site_type == SiteType::Cms && !has_selector_ext(site) {
            return SpiderKind::Cms;
        }
        if has_selector_ext(site) {
            return SpiderKind::Xpath;
        }
        SpiderKind::Cms
    }

    /// Return the live spider for a site, creating it on first use.
    ///
    /// Concurrent callers for the same key observe the same instance.
    pub async fn get(&self, site: &Site) -> Arc<SpiderHandle> {
        if let Some(slot) = self.slots.get(&site.key) {
            if slot.alive() {
                return slot.clone();
            }
            tracing::warn!(site = %site.key, "evicting dead spider");
            drop(slot);
            self.slots.remove(&site.key);
        }

        let gate = self
            .creating
            .entry(site.key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A racing creator may have won while this caller waited.
        if let Some(slot) = self.slots.get(&site.key) {
            if slot.alive() {
                return slot.clone();
            }
            drop(slot);
            self.slots.remove(&site.key);
        }

        let handle = Arc::new(self.build(site).await);
        self.slots.insert(site.key.clone(), handle.clone());
        handle
    }

    async fn build(&self, site: &Site) -> SpiderHandle {
        let kind = Self::infer_kind(site);
        let ctx = SpiderCtx::new(site.clone(), self.fetcher.clone());
        let epoch_cancel = self.epoch_cancel.read().clone();

        let built: Result<Arc<dyn Spider>> = match kind {
            SpiderKind::Cms => Ok(Arc::new(CmsSpider::new(ctx))),
            SpiderKind::Alist => Ok(Arc::new(AlistSpider::new(ctx))),
            SpiderKind::Xpath => XPathSpider::new(ctx).map(|s| Arc::new(s) as Arc<dyn Spider>),
            SpiderKind::Script => {
                let bridge = Arc::new(Bridge::new(
                    self.fetcher.clone(),
                    self.proxy_base.read().clone(),
                ));
                ScriptSpider::create(ctx, self.script_factory.as_ref(), bridge, &epoch_cancel)
                    .await
                    .map(|s| Arc::new(s) as Arc<dyn Spider>)
            }
            SpiderKind::Native => match self.native_factories.get(&site.key) {
                Some(factory) => factory(ctx),
                None => Err(Error::Config(format!(
                    "no native adapter registered for {}",
                    site.key
                ))),
            },
            SpiderKind::Null => Ok(Arc::new(NullSpider)),
        };

        match built {
            Ok(spider) => {
                tracing::debug!(site = %site.key, ?kind, "spider created");
                SpiderHandle::new(site.key.clone(), kind, false, spider, epoch_cancel)
            }
            Err(e) => {
                tracing::warn!(site = %site.key, ?kind, error = %e, "spider construction failed, degrading to null");
                SpiderHandle::new(
                    site.key.clone(),
                    SpiderKind::Null,
                    true,
                    Arc::new(NullSpider),
                    epoch_cancel,
                )
            }
        }
    }

    /// Destroy every spider atomically; called on config epoch change.
    ///
    /// In-flight operations see `Cancelled` and never touch the evicted
    /// instances again.
    pub async fn destroy_all(&self) {
        let old_cancel = {
            let mut guard = self.epoch_cancel.write();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        old_cancel.cancel();

        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                tokio::spawn(async move {
                    slot.spider.destroy().await;
                });
            }
        }
        self.creating.clear();
        tracing::info!("all spiders destroyed");
    }

    pub fn status(&self) -> Vec<SpiderStatus> {
        self.slots
            .iter()
            .map(|entry| SpiderStatus {
                key: entry.key.clone(),
                kind: entry.kind,
                degraded: entry.degraded,
            })
            .collect()
    }
}

fn has_selector_ext(site: &Site) -> bool {
    site.ext
        .as_ref()
        .and_then(|e| e.as_object())
        .and_then(|v| v.as_object())
        .is_some_and(|obj| obj.contains_key("list") && obj.contains_key("cateUrl"))
}
