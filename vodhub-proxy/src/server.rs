//! Embedded HTTP server
//!
//! Routes:
//!   `GET /`       — health + engine status
//!   `GET /proxy`  — `do`-dispatched proxy handlers (stream, m3u8, ck, …)
//!   `GET /parse`  — parser chain over HTTP, first success wins
//!   `GET /m3u8`   — playlist fetch + rewrite
//!
//! Handlers are re-registered on config epoch change. Every connection is
//! handled independently; parse and health requests get a hard timeout
//! while media streaming is left unbounded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use vodhub_core::config::{ActiveConfig, ConfigListener, ParserType};
use vodhub_core::error::Error;
use vodhub_core::extractor::parser::{parsed_url_and_headers, run_json_parser};
use vodhub_core::Orchestrator;

use crate::{error_response, fetch_and_rewrite_m3u8, stream_upstream};

/// Default loopback port.
pub const DEFAULT_PORT: u16 = 9978;

/// A registered `/proxy?do=<op>` handler.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn handle(
        &self,
        params: &HashMap<String, String>,
        client_headers: &HeaderMap,
        state: &ProxyState,
    ) -> Response;
}

#[derive(Clone)]
pub struct ProxyState {
    pub orchestrator: Arc<Orchestrator>,
    pub base: String,
    handlers: Arc<DashMap<String, Arc<dyn ProxyHandler>>>,
}

impl ProxyState {
    fn new(orchestrator: Arc<Orchestrator>, base: String) -> Self {
        let state = Self {
            orchestrator,
            base,
            handlers: Arc::new(DashMap::new()),
        };
        state.reset_handlers();
        state
    }

    /// Register (or replace) a proxy handler.
    pub fn register(&self, op: &str, handler: Arc<dyn ProxyHandler>) {
        self.handlers.insert(op.to_string(), handler);
    }

    /// Drop custom handlers and restore the built-ins.
    pub fn reset_handlers(&self) {
        self.handlers.clear();
        self.register("ck", Arc::new(HealthEcho));
        self.register("stream", Arc::new(StreamForward));
        self.register("m3u8", Arc::new(M3u8Rewrite));
    }
}

/// Re-registers the handler set when the config epoch changes.
struct HandlerReset {
    state: ProxyState,
}

impl ConfigListener for HandlerReset {
    fn on_config_change(&self, _config: &Arc<ActiveConfig>) {
        self.state.reset_handlers();
    }
}

/// `do=ck` — answers with the active epoch; clients use it as a liveness
/// probe for minted proxy URLs.
struct HealthEcho;

#[async_trait]
impl ProxyHandler for HealthEcho {
    async fn handle(
        &self,
        _params: &HashMap<String, String>,
        _client_headers: &HeaderMap,
        state: &ProxyState,
    ) -> Response {
        Json(serde_json::json!({"ok": true, "epoch": state.orchestrator.config().epoch}))
            .into_response()
    }
}

/// `do=stream` — forward the target URL without buffering.
struct StreamForward;

#[async_trait]
impl ProxyHandler for StreamForward {
    async fn handle(
        &self,
        params: &HashMap<String, String>,
        client_headers: &HeaderMap,
        state: &ProxyState,
    ) -> Response {
        let Some(url) = params.get("url") else {
            return error_response(
                StatusCode::BAD_REQUEST,
                &Error::Extractor("missing url parameter".into()),
            );
        };
        let headers = site_headers_for(state, params);
        match stream_upstream(url, &headers, client_headers).await {
            Ok(resp) => resp,
            Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
        }
    }
}

/// `do=m3u8` — same as the dedicated route, reachable through minted URLs.
struct M3u8Rewrite;

#[async_trait]
impl ProxyHandler for M3u8Rewrite {
    async fn handle(
        &self,
        params: &HashMap<String, String>,
        _client_headers: &HeaderMap,
        state: &ProxyState,
    ) -> Response {
        let Some(url) = params.get("url") else {
            return error_response(
                StatusCode::BAD_REQUEST,
                &Error::Extractor("missing url parameter".into()),
            );
        };
        let headers = site_headers_for(state, params);
        match fetch_and_rewrite_m3u8(
            state.orchestrator.fetcher(),
            url,
            headers,
            &state.base,
            &CancellationToken::new(),
        )
        .await
        {
            Ok(body) => (
                StatusCode::OK,
                [("Content-Type", "application/vnd.apple.mpegurl")],
                body,
            )
                .into_response(),
            Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
        }
    }
}

/// Headers of the site named by `site=<key>`, if any.
fn site_headers_for(state: &ProxyState, params: &HashMap<String, String>) -> HashMap<String, String> {
    params
        .get("site")
        .and_then(|key| state.orchestrator.config().doc.site(key).map(|s| s.headers()))
        .unwrap_or_default()
}

async fn health(State(state): State<ProxyState>) -> Response {
    let cache = state.orchestrator.cache().stats().await;
    let config = state.orchestrator.config();
    Json(serde_json::json!({
        "status": "ok",
        "epoch": config.epoch,
        "wallpaper": config.doc.wallpaper,
        "notice": config.doc.notice,
        "sites": config.doc.sites.len(),
        "spiders": state.orchestrator.manager().status(),
        "cache": cache,
    }))
    .into_response()
}

async fn proxy_dispatch(
    State(state): State<ProxyState>,
    Query(params): Query<HashMap<String, String>>,
    client_headers: HeaderMap,
) -> Response {
    let Some(op) = params.get("do") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &Error::Extractor("missing do parameter".into()),
        );
    };
    let Some(handler) = state.handlers.get(op).map(|h| h.value().clone()) else {
        return error_response(
            StatusCode::NOT_FOUND,
            &Error::Extractor(format!("no proxy handler for do={op}")),
        );
    };
    handler.handle(&params, &client_headers, &state).await
}

/// `GET /parse?jxs=<csv>&url=<u>` — first successful parser's JSON.
async fn parse_chain(
    State(state): State<ProxyState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(url) = params.get("url") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &Error::Extractor("missing url parameter".into()),
        );
    };

    let config = state.orchestrator.config();
    let requested: Vec<&str> = params
        .get("jxs")
        .map(|csv| csv.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let parsers: Vec<_> = if requested.is_empty() {
        config.doc.parses.iter().collect()
    } else {
        requested
            .iter()
            .filter_map(|name| config.doc.parser(name))
            .collect()
    };

    let cancel = CancellationToken::new();
    for parser in parsers {
        if parser.parser_type != ParserType::Json {
            continue;
        }
        match run_json_parser(state.orchestrator.fetcher(), parser, url, &cancel).await {
            Ok(reply) => {
                let (resolved, headers) = parsed_url_and_headers(&reply);
                return Json(serde_json::json!({
                    "name": parser.name,
                    "url": resolved,
                    "header": headers,
                }))
                .into_response();
            }
            Err(e) => {
                tracing::debug!(parser = %parser.name, error = %e, "parse route: parser failed");
            }
        }
    }

    error_response(
        StatusCode::NOT_FOUND,
        &Error::Extractor(format!("no parser resolved {url}")),
    )
}

async fn m3u8_route(
    State(state): State<ProxyState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    M3u8Rewrite.handle(&params, &HeaderMap::new(), &state).await
}

fn router(state: ProxyState) -> Router {
    let short_timeout = TimeoutLayer::new(Duration::from_secs(30));
    Router::new()
        .route("/", get(health).layer(short_timeout.clone()))
        .route("/parse", get(parse_chain).layer(short_timeout))
        .route("/proxy", get(proxy_dispatch))
        .route("/m3u8", get(m3u8_route))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Running server handle.
pub struct ProxyServer {
    pub addr: SocketAddr,
    pub base: String,
    pub state: ProxyState,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyServer {
    /// Bind the loopback port and start serving.
    ///
    /// A bind failure is surfaced as `Config` so the binary can map it to
    /// its dedicated exit code.
    pub async fn start(
        orchestrator: Arc<Orchestrator>,
        port: u16,
        cancel: CancellationToken,
    ) -> vodhub_core::Result<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Config(format!("proxy port {port} bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("proxy addr unavailable: {e}")))?;
        let base = format!("http://{addr}");

        let state = ProxyState::new(orchestrator.clone(), base.clone());
        orchestrator
            .resolver()
            .add_listener(Arc::new(HandlerReset {
                state: state.clone(),
            }));
        orchestrator.manager().set_proxy_base(base.clone());

        let app = router(state.clone());
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "proxy server terminated");
            }
        });

        tracing::info!(%addr, "local proxy listening");
        Ok(Self {
            addr,
            base,
            state,
            handle,
        })
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
