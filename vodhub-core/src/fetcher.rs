//! HTTP client wrapper
//!
//! One `Fetcher` is shared by every component. Per-site headers are merged
//! over global defaults, DNS may be resolved through a configured DoH
//! endpoint, and every call runs through the epoch's hook chain and honors a
//! cooperative cancellation token.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::cookie::Jar;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::Policy;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hooks::{HookChain, HookRequest, HookResponse, RequestAction, ResponseAction};

/// Response body cap; larger upstream bodies are an error.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Redirect hop limit.
const MAX_REDIRECTS: usize = 10;

/// Concurrent outbound request bound.
const DEFAULT_FETCH_POOL: usize = 8;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Fetcher construction options.
#[derive(Debug, Clone, Default)]
pub struct FetcherConfig {
    /// Global default headers merged under per-request headers.
    pub default_headers: HashMap<String, String>,
    /// DNS-over-HTTPS endpoint (e.g. `https://1.1.1.1/dns-query`).
    pub doh_endpoint: Option<String>,
    /// Process-wide outbound proxy URL.
    pub proxy: Option<String>,
    /// Default per-request timeout.
    pub default_timeout: Option<Duration>,
    /// Concurrent request bound; defaults to 8.
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: http::Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: http::Method::GET,
            headers: HashMap::new(),
            body: None,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl FetchResponse {
    /// Decode the body per the Content-Type charset, falling back to UTF-8.
    pub fn text(&self) -> String {
        let charset = self
            .headers
            .get("content-type")
            .and_then(|ct| {
                ct.split(';').find_map(|part| {
                    let part = part.trim();
                    part.strip_prefix("charset=").map(|c| c.trim_matches('"').to_string())
                })
            })
            .unwrap_or_default();

        if !charset.is_empty() {
            if let Some(encoding) = encoding_rs::Encoding::for_label(charset.as_bytes()) {
                let (decoded, _, _) = encoding.decode(&self.body);
                return decoded.into_owned();
            }
        }
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Parse(format!("invalid JSON body: {e}")))
    }
}

/// DNS-over-HTTPS resolver plugged into reqwest.
///
/// Queries the configured endpoint with `?name=<host>&type=A` and the
/// `application/dns-json` accept header; answers are cached for their TTL
/// (min 60 s).
#[derive(Clone)]
struct DohResolver {
    inner: Arc<DohInner>,
}

struct DohInner {
    endpoint: String,
    client: reqwest::Client,
    cache: DashMap<String, (Vec<IpAddr>, Instant)>,
}

#[derive(serde::Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
    #[serde(rename = "TTL", default)]
    ttl: u64,
}

#[derive(serde::Deserialize)]
struct DohReply {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

impl DohResolver {
    fn new(endpoint: String) -> Self {
        Self {
            inner: Arc::new(DohInner {
                endpoint,
                client: reqwest::Client::new(),
                cache: DashMap::new(),
            }),
        }
    }
}

impl DohInner {
    async fn lookup(&self, host: &str) -> std::result::Result<Vec<IpAddr>, String> {
        if let Some(entry) = self.cache.get(host) {
            let (ips, expires) = entry.value();
            if *expires > Instant::now() {
                return Ok(ips.clone());
            }
        }

        let url = format!("{}?name={}&type=A", self.endpoint, host);
        let reply: DohReply = self
            .client
            .get(&url)
            .header("Accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| format!("DoH query failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("DoH reply unparseable: {e}"))?;

        let mut ttl = u64::MAX;
        let ips: Vec<IpAddr> = reply
            .answer
            .iter()
            .filter(|a| a.record_type == 1)
            .filter_map(|a| {
                ttl = ttl.min(a.ttl);
                a.data.parse().ok()
            })
            .collect();

        if ips.is_empty() {
            return Err(format!("DoH returned no A records for {host}"));
        }

        let ttl = Duration::from_secs(ttl.clamp(60, 86_400));
        self.cache
            .insert(host.to_string(), (ips.clone(), Instant::now() + ttl));
        Ok(ips)
    }
}

impl Resolve for DohResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.inner.clone();
        Box::pin(async move {
            let ips = resolver
                .lookup(name.as_str())
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })?;
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// Shared HTTP client.
pub struct Fetcher {
    client: reqwest::Client,
    jar: Arc<Jar>,
    defaults: HashMap<String, String>,
    default_timeout: Duration,
    hooks: RwLock<Arc<HookChain>>,
    pool: tokio::sync::Semaphore,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .redirect(Policy::limited(MAX_REDIRECTS));

        if let Some(endpoint) = &config.doh_endpoint {
            builder = builder.dns_resolver(Arc::new(DohResolver::new(endpoint.clone())));
        }
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::Config(format!("invalid proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let mut defaults = config.default_headers;
        defaults
            .entry("User-Agent".to_string())
            .or_insert_with(|| DEFAULT_USER_AGENT.to_string());

        Ok(Self {
            client,
            jar,
            defaults,
            default_timeout: config.default_timeout.unwrap_or(Duration::from_secs(15)),
            hooks: RwLock::new(Arc::new(HookChain::default())),
            pool: tokio::sync::Semaphore::new(
                config.max_concurrent.unwrap_or(DEFAULT_FETCH_POOL).max(1),
            ),
        })
    }

    /// Install the hook chain for the current config epoch.
    pub fn set_hooks(&self, chain: HookChain) {
        *self.hooks.write() = Arc::new(chain);
    }

    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute a request through the hook chain.
    ///
    /// Idempotent GETs that fail with a transport error are retried once
    /// after a short backoff; timeouts are not retried.
    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse> {
        let hooks = self.hooks.read().clone();

        let mut merged = self.defaults.clone();
        merged.extend(request.headers.clone());

        let hook_req = HookRequest {
            url: request.url.clone(),
            method: request.method.to_string(),
            headers: merged,
        };
        let hook_req = match hooks.apply_request(hook_req) {
            RequestAction::Continue(r) => r,
            RequestAction::ShortCircuit(resp) => {
                return Ok(FetchResponse {
                    status: resp.status,
                    headers: resp.headers,
                    body: resp.body,
                });
            }
            RequestAction::Cancel(reason) => {
                return Err(Error::Network(format!("request blocked by hook: {reason}")));
            }
        };

        let is_idempotent = request.method == http::Method::GET;
        let mut attempt = 0usize;
        let response = loop {
            attempt += 1;
            match self.execute(&request, &hook_req, cancel).await {
                Ok(resp) => break resp,
                Err(e) if is_idempotent && attempt == 1 && e.is_retryable() => {
                    tracing::debug!(url = %hook_req.url, error = %e, "retrying idempotent GET");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => return Err(e),
            }
        };

        match hooks.apply_response(response) {
            ResponseAction::Continue(resp) => Ok(FetchResponse {
                status: resp.status,
                headers: resp.headers,
                body: resp.body,
            }),
            ResponseAction::Cancel(reason) => {
                Err(Error::Network(format!("response dropped by hook: {reason}")))
            }
        }
    }

    async fn execute(
        &self,
        request: &FetchRequest,
        hook_req: &HookRequest,
        cancel: &CancellationToken,
    ) -> Result<HookResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &hook_req.url)
            .timeout(request.timeout);

        for (k, v) in &hook_req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let send = async {
            let _permit = self
                .pool
                .acquire()
                .await
                .map_err(|_| Error::Cancelled)?;
            let resp = builder.send().await.map_err(Error::from)?;

            let status = resp.status().as_u16();
            let mut headers = HashMap::new();
            for (name, value) in resp.headers() {
                if let Ok(v) = value.to_str() {
                    headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
                }
            }

            if let Some(len) = resp.content_length() {
                if len as usize > MAX_BODY_BYTES {
                    return Err(Error::Network(format!(
                        "response body {len} bytes exceeds {MAX_BODY_BYTES} byte cap"
                    )));
                }
            }

            let mut body = BytesMut::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(Error::from)?;
                if body.len() + chunk.len() > MAX_BODY_BYTES {
                    return Err(Error::Network(format!(
                        "response body exceeds {MAX_BODY_BYTES} byte cap"
                    )));
                }
                body.extend_from_slice(&chunk);
            }

            Ok(HookResponse {
                url: hook_req.url.clone(),
                status,
                headers,
                body: body.freeze(),
            })
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = send => result,
        }
    }

    /// Convenience GET returning the decoded body.
    pub async fn get_text(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let resp = self
            .fetch(
                FetchRequest::get(url).with_headers(headers).with_timeout(timeout),
                cancel,
            )
            .await?;
        Ok(resp.text())
    }

    /// Convenience GET decoding a JSON body.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let resp = self
            .fetch(
                FetchRequest::get(url).with_headers(headers).with_timeout(timeout),
                cancel,
            )
            .await?;
        resp.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetches_and_decodes_text() {
        let base = serve(Router::new().route("/t", get(|| async { "hello" }))).await;
        let fetcher = Fetcher::new(FetcherConfig::default()).expect("fetcher");

        let text = fetcher
            .get_text(
                &format!("{base}/t"),
                HashMap::new(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn merges_default_headers_under_request_headers() {
        let seen = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let seen_clone = seen.clone();
        let base = serve(Router::new().route(
            "/h",
            get(move |headers: axum::http::HeaderMap| {
                let seen = seen_clone.clone();
                async move {
                    let mut map = seen.lock();
                    for (k, v) in &headers {
                        map.insert(k.to_string(), v.to_str().unwrap_or("").to_string());
                    }
                    "ok"
                }
            }),
        ))
        .await;

        let mut defaults = HashMap::new();
        defaults.insert("X-Common".to_string(), "global".to_string());
        let fetcher = Fetcher::new(FetcherConfig {
            default_headers: defaults,
            ..FetcherConfig::default()
        })
        .expect("fetcher");

        let mut site_headers = HashMap::new();
        site_headers.insert("User-Agent".to_string(), "site-agent".to_string());
        fetcher
            .get_text(
                &format!("{base}/h"),
                site_headers,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");

        let map = seen.lock();
        assert_eq!(map.get("x-common").map(String::as_str), Some("global"));
        assert_eq!(map.get("user-agent").map(String::as_str), Some("site-agent"));
    }

    #[tokio::test]
    async fn retries_idempotent_get_once_on_transport_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let base = serve(Router::new().route(
            "/flaky",
            get(move || {
                let hits = hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "late ok"
                }
            }),
        ))
        .await;

        // A closed port produces a transport error on the first URL; the
        // retry targets the same URL, so use a working route and just verify
        // the success path counts a single hit.
        let fetcher = Fetcher::new(FetcherConfig::default()).expect("fetcher");
        fetcher
            .get_text(
                &format!("{base}/flaky"),
                HashMap::new(),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .expect("fetch");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // And a connection-refused error is retried exactly once, then surfaced.
        let start = std::time::Instant::now();
        let err = fetcher
            .get_text(
                "http://127.0.0.1:9/never",
                HashMap::new(),
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Network(_)));
        assert!(start.elapsed() >= Duration::from_millis(200), "one backoff expected");
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "never"
            }),
        ))
        .await;

        let fetcher = Fetcher::new(FetcherConfig::default()).expect("fetcher");
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child.cancel();
        });

        let err = fetcher
            .get_text(
                &format!("{base}/slow"),
                HashMap::new(),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .expect_err("must cancel");
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn charset_decoding_falls_back_to_utf8() {
        let resp = FetchResponse {
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/html; charset=gbk".to_string(),
            )]),
            // "你好" in GBK
            body: Bytes::from_static(&[0xc4, 0xe3, 0xba, 0xc3]),
        };
        assert_eq!(resp.text(), "你好");

        let plain = FetchResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from_static("plain".as_bytes()),
        };
        assert_eq!(plain.text(), "plain");
    }
}
