//! Script-backed spider (JS / Python)
//!
//! Loads the user script through the fetcher, feeds it to a host created by
//! the injected factory, and calls the five operations by name. An operation
//! the script does not implement falls back to a documented default shape
//! instead of failing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::vod::{CategoryPage, HomeContent, PlayResult, VodList};
use super::{default_search_result, Spider, SpiderCtx};
use crate::error::{Error, Result};
use crate::script::{guarded_call, Bridge, ScriptEngine, ScriptHost, ScriptHostFactory};

pub struct ScriptSpider {
    ctx: SpiderCtx,
    host: Box<dyn ScriptHost>,
    bridge: Arc<Bridge>,
    alive: AtomicBool,
}

impl ScriptSpider {
    /// Fetch the script source, boot a host, and run its `init(ext)`.
    pub async fn create(
        ctx: SpiderCtx,
        factory: &dyn ScriptHostFactory,
        bridge: Arc<Bridge>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let engine = ScriptEngine::infer(&ctx.site.api_url);
        let host = factory.create(engine, bridge.clone())?;
        host.init().await?;

        let source = ctx
            .fetcher
            .get_text(&ctx.site.api_url, ctx.headers(), ctx.timeout(), cancel)
            .await?;
        host.eval(&source).await?;

        if host.has_fn("init").await {
            guarded_call(
                host.as_ref(),
                "init",
                vec![Value::String(ctx.site.ext_passthrough())],
                cancel,
            )
            .await?;
        }

        Ok(Self {
            ctx,
            host,
            bridge,
            alive: AtomicBool::new(true),
        })
    }

    /// Call a script operation, decoding its JSON (or JSON-string) result.
    async fn call_op<T>(&self, name: &str, args: Vec<Value>, cancel: &CancellationToken) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value = match guarded_call(self.host.as_ref(), name, args, cancel).await {
            Ok(value) => value,
            Err(e @ Error::ScriptTimeout(_)) => {
                // A forcibly abandoned call leaves the VM in an unknown
                // state; the manager will evict this spider.
                self.alive.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let value = match value {
            Value::String(text) => serde_json::from_str(&text).map_err(|e| {
                Error::Parse(format!("script {name} returned unparseable JSON: {e}"))
            })?,
            other => other,
        };
        serde_json::from_value(value)
            .map_err(|e| Error::Parse(format!("script {name} returned unexpected shape: {e}")))
    }

    fn site_key(&self) -> &str {
        &self.ctx.site.key
    }
}

#[async_trait]
impl Spider for ScriptSpider {
    async fn home_content(&self, filter: bool, cancel: &CancellationToken) -> Result<HomeContent> {
        if !self.host.has_fn("homeContent").await {
            return Ok(HomeContent::default());
        }
        self.call_op("homeContent", vec![Value::Bool(filter)], cancel).await
    }

    async fn category_content(
        &self,
        tid: &str,
        pg: u32,
        filter: bool,
        extend: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CategoryPage> {
        if !self.host.has_fn("categoryContent").await {
            return Ok(CategoryPage {
                page: pg,
                ..CategoryPage::default()
            });
        }
        let mut page: CategoryPage = self
            .call_op(
                "categoryContent",
                vec![
                    Value::String(tid.to_string()),
                    Value::String(pg.to_string()),
                    Value::Bool(filter),
                    serde_json::to_value(extend)?,
                ],
                cancel,
            )
            .await?;
        for vod in &mut page.list {
            if vod.site_key.is_empty() {
                vod.site_key = self.site_key().to_string();
            }
        }
        Ok(page)
    }

    async fn detail_content(&self, ids: &[String], cancel: &CancellationToken) -> Result<VodList> {
        if !self.host.has_fn("detailContent").await {
            return Ok(VodList::default());
        }
        let mut list: VodList = self
            .call_op(
                "detailContent",
                vec![serde_json::to_value(ids)?],
                cancel,
            )
            .await?;
        for vod in &mut list.list {
            if vod.site_key.is_empty() {
                vod.site_key = self.site_key().to_string();
            }
        }
        Ok(list)
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
        if !self.host.has_fn("searchContent").await {
            return Ok(default_search_result(key));
        }
        let mut list: VodList = self
            .call_op(
                "searchContent",
                vec![Value::String(key.to_string()), Value::Bool(quick)],
                cancel,
            )
            .await?;
        for vod in &mut list.list {
            if vod.site_key.is_empty() {
                vod.site_key = self.site_key().to_string();
            }
        }
        Ok(list)
    }

    async fn player_content(
        &self,
        flag: &str,
        id: &str,
        vip_flags: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlayResult> {
        if !self.host.has_fn("playerContent").await {
            return Ok(PlayResult::needs_parser(id, flag));
        }
        self.call_op(
            "playerContent",
            vec![
                Value::String(flag.to_string()),
                Value::String(id.to_string()),
                serde_json::to_value(vip_flags)?,
            ],
            cancel,
        )
        .await
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn destroy(&self) {
        self.bridge.cancel();
        self.host.destroy().await;
    }
}
