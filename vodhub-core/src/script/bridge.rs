//! Native bridges injected into script hosts
//!
//! The bridge API is a stable contract (version 1): `req`, `pdfh`, `pdfa`,
//! `joinUrl`, `b64encode`, `b64decode`, `sleep`, `log`, `matchAll`,
//! `proxyUrl`. Each call is synchronous from the script's perspective; the
//! host blocks its calling coroutine on the returned future.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use parking_lot::RwLock;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::{FetchRequest, Fetcher};

/// Bridge contract version reported to hosts.
pub const BRIDGE_VERSION: u32 = 1;

/// Options accepted by the `req` bridge.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ReqOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Native call surface handed to every script host.
///
/// Holds the shared fetcher and the cancellation token of the spider
/// operation the script is serving; bridge I/O aborts with the operation.
pub struct Bridge {
    fetcher: Arc<Fetcher>,
    proxy_base: RwLock<String>,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(fetcher: Arc<Fetcher>, proxy_base: String) -> Self {
        Self {
            fetcher,
            proxy_base: RwLock::new(proxy_base),
            cancel: CancellationToken::new(),
        }
    }

    /// Token the host should propagate into long-running native calls.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn set_proxy_base(&self, base: String) {
        *self.proxy_base.write() = base;
    }

    /// `req(url, opts)` — HTTP from script land.
    /// Returns `{code, headers, content}`.
    pub async fn req(&self, url: &str, opts: ReqOptions) -> Result<Value> {
        let method = opts
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_uppercase()
            .parse::<http::Method>()
            .map_err(|_| Error::Script(format!("req: bad method for {url}")))?;

        let mut request = FetchRequest::get(url)
            .with_headers(opts.headers)
            .with_timeout(Duration::from_millis(opts.timeout.unwrap_or(15_000)));
        request.method = method;
        request.body = opts.body.map(|b| bytes::Bytes::from(b.into_bytes()));

        let resp = self.fetcher.fetch(request, &self.cancel).await?;
        Ok(json!({
            "code": resp.status,
            "headers": resp.headers,
            "content": resp.text(),
        }))
    }

    /// `pdfh(html, rule)` — first match of a selector rule.
    pub fn pdfh(&self, html: &str, rule: &str) -> String {
        select_first(html, rule)
    }

    /// `pdfa(html, rule)` — all matches of a selector rule.
    pub fn pdfa(&self, html: &str, rule: &str) -> Vec<String> {
        select_all(html, rule)
    }

    /// `joinUrl(base, path)`.
    pub fn join_url(&self, base: &str, path: &str) -> String {
        join_url(base, path)
    }

    /// `b64encode(text)`.
    pub fn b64_encode(&self, text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
    }

    /// `b64decode(text)` — invalid input decodes to the empty string.
    pub fn b64_decode(&self, text: &str) -> String {
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .unwrap_or_default()
    }

    /// `sleep(ms)` — bounded to 5 s to keep scripts inside the call deadline.
    pub async fn sleep(&self, ms: u64) {
        let bounded = Duration::from_millis(ms.min(5_000));
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(bounded) => {}
        }
    }

    /// `log(msg)` — script output lands in the engine's structured logs.
    pub fn log(&self, message: &str) {
        tracing::info!(target: "vodhub::script", "{message}");
    }

    /// `matchAll(pattern, text)` — all full-match captures.
    pub fn match_all(&self, pattern: &str, text: &str) -> Vec<String> {
        match regex::Regex::new(pattern) {
            Ok(re) => re.find_iter(text).map(|m| m.as_str().to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// `proxyUrl(do, url)` — mint a local-proxy URL for the payload.
    pub fn proxy_url(&self, op: &str, url: &str) -> String {
        let base = self.proxy_base.read().clone();
        format!(
            "{}/proxy?do={}&url={}",
            base.trim_end_matches('/'),
            op,
            percent_encoding::utf8_percent_encode(url, percent_encoding::NON_ALPHANUMERIC)
        )
    }
}

/// Resolve a possibly-relative URL against a base.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    match url::Url::parse(base).and_then(|b| b.join(path)) {
        Ok(joined) => joined.to_string(),
        Err(_) => path.to_string(),
    }
}

/// First match of a `sel&&sel&&Attr` rule.
pub(crate) fn select_first(html: &str, rule: &str) -> String {
    select_all(html, rule).into_iter().next().unwrap_or_default()
}

/// Evaluate a `sel&&sel&&Attr` rule against HTML.
///
/// Every `&&` segment except a trailing attribute segment is a CSS
/// selector; each segment fans out over all matches of the previous scope.
/// The trailing segment may be `Text`, `Html`, or an attribute name.
pub(crate) fn select_all(html: &str, rule: &str) -> Vec<String> {
    let segments: Vec<&str> = rule.split("&&").map(str::trim).collect();
    if segments.is_empty() {
        return Vec::new();
    }

    let (selector_segments, attr) = match segments.last() {
        Some(last) if is_attr_segment(last) => (&segments[..segments.len() - 1], *last),
        _ => (&segments[..], "Html"),
    };
    if selector_segments.is_empty() {
        return Vec::new();
    }

    let document = Html::parse_document(html);
    let mut scope: Vec<ElementRef> = vec![document.root_element()];

    for segment in selector_segments {
        let Ok(selector) = Selector::parse(segment) else {
            return Vec::new();
        };
        let next: Vec<ElementRef> = scope
            .iter()
            .flat_map(|element| element.select(&selector))
            .collect();
        if next.is_empty() {
            return Vec::new();
        }
        scope = next;
    }

    scope.into_iter().map(|el| extract(el, attr)).collect()
}

fn is_attr_segment(segment: &str) -> bool {
    segment == "Text"
        || segment == "Html"
        || !segment.contains(|c: char| c == '.' || c == '#' || c == ' ' || c == '>')
            && matches!(
                segment,
                "href" | "src" | "title" | "alt" | "data-src" | "data-original" | "content" | "value" | "style"
            )
}

fn extract(element: ElementRef, attr: &str) -> String {
    match attr {
        "Text" => element.text().collect::<Vec<_>>().join("").trim().to_string(),
        "Html" => element.inner_html(),
        name => element.value().attr(name).unwrap_or_default().to_string(),
    }
}
