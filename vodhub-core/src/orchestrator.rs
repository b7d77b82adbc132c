//! Top-level facade
//!
//! Wires the cache, spider manager, hook chain, extractor pipeline, and
//! searcher behind the five public operations. Every operation derives a
//! cache key from `(op, site, args, epoch)`, so an epoch change naturally
//! invalidates without flushing, and emits a structured latency log line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::config::{ActiveConfig, ConfigListener, ConfigResolver, Site};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::extractor::{
    DirectMediaExtractor, ExtractorPipeline, LatchBackend, ParserChainExtractor, PeerBackend,
    PushExtractor, ServiceBoundExtractor, TorrentExtractor, TvBusExtractor, VideoSchemeExtractor,
};
use crate::fetcher::Fetcher;
use crate::hooks::{AdBlockHook, CookieInjectHook, Hook, HookChain, HostRewriteHook};
use crate::searcher::{ConcurrentSearcher, SearchHit};
use crate::spider::vod::{CategoryPage, HomeContent, PlayResult, Vod, VodList};
use crate::spider::{is_media_url, SpiderManager};

const TTL_HOME: Duration = Duration::from_secs(24 * 3600);
const TTL_CATEGORY: Duration = Duration::from_secs(10 * 60);
const TTL_DETAIL: Duration = Duration::from_secs(30 * 60);
const TTL_SEARCH: Duration = Duration::from_secs(10 * 60);

/// Opaque sink for user data (search history and the like); persistence
/// itself lives outside the engine.
pub trait UserDataSink: Send + Sync {
    fn record_search(&self, query: &str);
}

pub struct NoopUserDataSink;

impl UserDataSink for NoopUserDataSink {
    fn record_search(&self, _query: &str) {}
}

/// External extractor backends; all optional.
#[derive(Default, Clone)]
pub struct ExtractorBackends {
    pub torrent: Option<Arc<dyn PeerBackend>>,
    pub jianpian: Option<Arc<dyn PeerBackend>>,
    pub tvbus: Option<Arc<dyn LatchBackend>>,
    pub peer_service: Option<(Arc<dyn PeerBackend>, watch::Receiver<bool>)>,
}

/// Static hook inputs that are not part of the config document.
#[derive(Default, Clone)]
pub struct HookOptions {
    pub host_rewrites: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
}

fn build_hooks(options: &HookOptions, ads: &[String]) -> HookChain {
    let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();
    if !options.host_rewrites.is_empty() {
        hooks.push(Arc::new(HostRewriteHook::new(options.host_rewrites.clone())));
    }
    if !ads.is_empty() {
        hooks.push(Arc::new(AdBlockHook::new(ads.to_vec())));
    }
    if !options.cookies.is_empty() {
        hooks.push(Arc::new(CookieInjectHook::new(options.cookies.clone())));
    }
    HookChain::new(hooks)
}

fn build_pipeline(
    fetcher: &Arc<Fetcher>,
    events: &EventBus,
    backends: &ExtractorBackends,
    config: &ActiveConfig,
) -> ExtractorPipeline {
    let mut extractors: Vec<Arc<dyn crate::extractor::Extractor>> = vec![
        Arc::new(DirectMediaExtractor),
        Arc::new(VideoSchemeExtractor),
        Arc::new(PushExtractor::new(events.clone())),
        Arc::new(TorrentExtractor::torrent(backends.torrent.clone())),
        Arc::new(TorrentExtractor::jianpian(backends.jianpian.clone())),
        Arc::new(TvBusExtractor::new(backends.tvbus.clone())),
    ];
    if let Some((backend, ready)) = &backends.peer_service {
        extractors.push(Arc::new(ServiceBoundExtractor::new(
            backend.clone(),
            ready.clone(),
        )));
    }
    extractors.push(Arc::new(ParserChainExtractor::new(
        fetcher.clone(),
        config.doc.parses.clone(),
    )));
    ExtractorPipeline::new(extractors)
}

/// Epoch listener: swaps hooks, spiders, and the extractor pipeline.
struct EpochRewire {
    fetcher: Arc<Fetcher>,
    manager: Arc<SpiderManager>,
    events: EventBus,
    backends: ExtractorBackends,
    hook_options: HookOptions,
    pipeline: Arc<RwLock<Arc<ExtractorPipeline>>>,
}

impl ConfigListener for EpochRewire {
    fn on_config_change(&self, config: &Arc<ActiveConfig>) {
        self.fetcher
            .set_hooks(build_hooks(&self.hook_options, &config.doc.ads));

        let new_pipeline = Arc::new(build_pipeline(
            &self.fetcher,
            &self.events,
            &self.backends,
            config,
        ));
        let old = std::mem::replace(&mut *self.pipeline.write(), new_pipeline);

        let manager = self.manager.clone();
        tokio::spawn(async move {
            manager.destroy_all().await;
            old.exit_all().await;
        });
    }
}

pub struct Orchestrator {
    fetcher: Arc<Fetcher>,
    cache: Arc<CacheStore>,
    resolver: Arc<ConfigResolver>,
    manager: Arc<SpiderManager>,
    searcher: ConcurrentSearcher,
    pipeline: Arc<RwLock<Arc<ExtractorPipeline>>>,
    events: EventBus,
    sink: Arc<dyn UserDataSink>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<Fetcher>,
        cache: Arc<CacheStore>,
        resolver: Arc<ConfigResolver>,
        manager: Arc<SpiderManager>,
        events: EventBus,
        backends: ExtractorBackends,
        hook_options: HookOptions,
        sink: Arc<dyn UserDataSink>,
    ) -> Arc<Self> {
        let initial = Arc::new(build_pipeline(
            &fetcher,
            &events,
            &backends,
            &resolver.active(),
        ));
        let pipeline = Arc::new(RwLock::new(initial));

        resolver.add_listener(Arc::new(EpochRewire {
            fetcher: fetcher.clone(),
            manager: manager.clone(),
            events: events.clone(),
            backends,
            hook_options,
            pipeline: pipeline.clone(),
        }));

        Arc::new(Self {
            fetcher: fetcher.clone(),
            cache,
            resolver,
            searcher: ConcurrentSearcher::new(manager.clone()),
            manager,
            pipeline,
            events,
            sink,
        })
    }

    pub fn config(&self) -> Arc<ActiveConfig> {
        self.resolver.active()
    }

    pub fn manager(&self) -> &Arc<SpiderManager> {
        &self.manager
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn pipeline(&self) -> Arc<ExtractorPipeline> {
        self.pipeline.read().clone()
    }

    fn site(&self, site_key: &str) -> Result<(Arc<ActiveConfig>, Site)> {
        let config = self.resolver.active();
        let site = config
            .doc
            .site(site_key)
            .cloned()
            .ok_or_else(|| Error::SiteNotFound(site_key.to_string()))?;
        Ok((config, site))
    }

    /// Cached call shared by the read operations: serialize through the
    /// cache so concurrent identical requests collapse into one load.
    async fn cached<T, F, Fut>(&self, key: String, ttl: Duration, loader: F) -> Result<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
    {
        let bytes = self
            .cache
            .get_or_compute(&key, ttl, || async {
                let value = loader().await?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            })
            .await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    fn log_op(op: &str, site: &str, started: Instant, outcome: &Result<impl Sized>) {
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(_) => tracing::info!(op, site, latency_ms, outcome = "ok"),
            Err(e) => {
                tracing::warn!(op, site, latency_ms, outcome = "error", kind = e.kind(), error = %e);
            }
        }
    }

    pub async fn home(
        &self,
        site_key: &str,
        filter: bool,
        cancel: &CancellationToken,
    ) -> Result<HomeContent> {
        let started = Instant::now();
        let result = async {
            let (config, site) = self.site(site_key)?;
            let key = format!("home|{site_key}|{filter}|{}", config.epoch);
            self.cached(key, TTL_HOME, || async {
                let spider = self.manager.get(&site).await;
                spider.home_content(filter, cancel).await
            })
            .await
        }
        .await;
        Self::log_op("home", site_key, started, &result);
        result
    }

    pub async fn category(
        &self,
        site_key: &str,
        tid: &str,
        pg: u32,
        filter: bool,
        extend: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CategoryPage> {
        let started = Instant::now();
        let result = async {
            let (config, site) = self.site(site_key)?;
            let mut extend_key: Vec<(&String, &String)> = extend.iter().collect();
            extend_key.sort();
            let key = format!(
                "category|{site_key}|{tid}|{pg}|{filter}|{extend_key:?}|{}",
                config.epoch
            );
            self.cached(key, TTL_CATEGORY, || async {
                let spider = self.manager.get(&site).await;
                spider.category_content(tid, pg, filter, extend, cancel).await
            })
            .await
        }
        .await;
        Self::log_op("category", site_key, started, &result);
        result
    }

    pub async fn detail(
        &self,
        site_key: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<VodList> {
        let started = Instant::now();
        let result = async {
            let (config, site) = self.site(site_key)?;
            let key = format!("detail|{site_key}|{}|{}", ids.join(","), config.epoch);
            self.cached(key, TTL_DETAIL, || async {
                let spider = self.manager.get(&site).await;
                spider.detail_content(ids, cancel).await
            })
            .await
        }
        .await;
        Self::log_op("detail", site_key, started, &result);
        result
    }

    pub async fn search(
        &self,
        query: &str,
        quick: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vod>> {
        let started = Instant::now();
        let result = async {
            let query = query.trim();
            if query.is_empty() {
                return Ok(Vec::new());
            }
            self.sink.record_search(query);
            self.events.publish(EngineEvent::SearchPerformed {
                query: query.to_string(),
            });

            let config = self.resolver.active();
            let key = format!("search|{query}|{quick}|{}", config.epoch);
            let sites = config.doc.sites.clone();
            self.cached(key, TTL_SEARCH, || async {
                self.searcher
                    .search_collect(query, quick, sites, cancel.child_token())
                    .await
            })
            .await
        }
        .await;
        Self::log_op("search", "*", started, &result);
        result
    }

    /// Streaming search; batches arrive as sites answer. Uncached.
    pub fn search_stream(
        &self,
        query: &str,
        quick: bool,
        cancel: CancellationToken,
    ) -> tokio::sync::mpsc::Receiver<SearchHit> {
        if !query.trim().is_empty() {
            self.sink.record_search(query.trim());
        }
        let sites = self.resolver.active().doc.sites.clone();
        let (rx, _summary) = self.searcher.stream(query, quick, sites, cancel);
        rx
    }

    pub async fn play(
        &self,
        site_key: &str,
        flag: &str,
        id: &str,
        vip_flags: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        let started = Instant::now();
        let result = async {
            // An id that is already a direct media URL needs neither the
            // spider nor any parser.
            if (id.starts_with("http://") || id.starts_with("https://")) && is_media_url(id) {
                let mut play = PlayResult::direct(id);
                play.flag = flag.to_string();
                return Ok(play);
            }

            let (_config, site) = self.site(site_key)?;
            let spider = self.manager.get(&site).await;
            let play = spider.player_content(flag, id, vip_flags, cancel).await?;
            let pipeline = self.pipeline();
            pipeline.resolve(play, cancel).await
        }
        .await;
        Self::log_op("play", site_key, started, &result);
        result
    }
}
