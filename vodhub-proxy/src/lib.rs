//! Local playback proxy
//!
//! Embedded loopback HTTP server that brokers media and parse requests for
//! clients that need a local origin: stream forwarding with per-site
//! headers, m3u8 rewriting (relative URIs absolutized, nested playlists and
//! AES key URIs re-proxied), and the parser chain over HTTP.

pub mod server;

use std::collections::HashMap;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use tokio_util::sync::CancellationToken;

use vodhub_core::error::{Error, Result};
use vodhub_core::fetcher::{FetchRequest, Fetcher};

pub use server::{ProxyHandler, ProxyServer, ProxyState};

/// Build a percent-encoded `url=` query value.
pub fn encode_query_url(url: &str) -> String {
    percent_encoding::utf8_percent_encode(url, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Forward an upstream resource to the client without buffering.
///
/// Hop-by-hop headers are dropped in both directions; everything else is
/// forwarded so range requests and content types survive.
pub async fn stream_upstream(
    url: &str,
    headers: &HashMap<String, String>,
    client_headers: &axum::http::HeaderMap,
) -> Result<Response> {
    let client = reqwest::Client::new();
    let mut request = client.get(url);

    for (name, value) in client_headers {
        if matches!(
            name.as_str(),
            "host" | "connection" | "accept-encoding" | "content-length" | "transfer-encoding"
        ) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request = request.header(name.as_str(), v);
        }
    }
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if !headers.contains_key("User-Agent") {
        request = request.header(
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
        );
    }

    let upstream = request.send().await.map_err(Error::from)?;
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    let stream = upstream
        .bytes_stream()
        .map_err(|e| std::io::Error::other(e.to_string()));

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in &upstream_headers {
        if matches!(
            name.as_str(),
            "connection" | "transfer-encoding" | "content-encoding" | "content-length"
        ) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }
    builder = builder.header("Cache-Control", "no-cache");

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Network(format!("failed to build proxy response: {e}")))
}

/// Fetch an upstream m3u8 and rewrite it against the local proxy base.
pub async fn fetch_and_rewrite_m3u8(
    fetcher: &Fetcher,
    url: &str,
    headers: HashMap<String, String>,
    proxy_base: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let resp = fetcher
        .fetch(
            FetchRequest::get(url)
                .with_headers(headers)
                .with_timeout(std::time::Duration::from_secs(15)),
            cancel,
        )
        .await?;
    if resp.status >= 400 {
        return Err(Error::Network(format!(
            "upstream m3u8 answered {}",
            resp.status
        )));
    }
    let body = resp.text();
    if !body.contains("#EXTM3U") {
        return Err(Error::Parse(format!("{url} is not an m3u8 playlist")));
    }
    Ok(rewrite_m3u8(&body, url, proxy_base))
}

/// Rewrite a playlist so the client can keep talking to the local proxy:
/// relative URIs become absolute, nested playlists loop back through
/// `/m3u8`, and key/map URIs go through `/proxy` so DRM-ish fetches carry
/// the right headers.
pub fn rewrite_m3u8(playlist: &str, source_url: &str, proxy_base: &str) -> String {
    let base = url::Url::parse(source_url).ok();
    let mut output = String::with_capacity(playlist.len());

    for line in playlist.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            output.push_str(&rewrite_uri_attribute(trimmed, base.as_ref(), proxy_base));
        } else if trimmed.is_empty() {
            output.push_str(line);
        } else {
            let absolute = make_absolute(trimmed, base.as_ref());
            if absolute.split(['?', '#']).next().unwrap_or("").ends_with(".m3u8") {
                output.push_str(&format!(
                    "{proxy_base}/m3u8?url={}",
                    encode_query_url(&absolute)
                ));
            } else {
                output.push_str(&absolute);
            }
        }
        output.push('\n');
    }
    output
}

fn make_absolute(raw: &str, base: Option<&url::Url>) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    if let Some(base) = base {
        if let Ok(joined) = base.join(raw) {
            return joined.to_string();
        }
    }
    raw.to_string()
}

/// Rewrite any `URI="…"` attribute (EXT-X-KEY, EXT-X-MAP, …) to fetch
/// through the proxy.
fn rewrite_uri_attribute(line: &str, base: Option<&url::Url>, proxy_base: &str) -> String {
    let pattern = "URI=\"";
    let mut result = String::with_capacity(line.len());
    let mut remaining = line;

    while let Some(start) = remaining.find(pattern) {
        result.push_str(&remaining[..start + pattern.len()]);
        remaining = &remaining[start + pattern.len()..];

        if let Some(end) = remaining.find('"') {
            let absolute = make_absolute(&remaining[..end], base);
            result.push_str(&format!(
                "{proxy_base}/proxy?do=stream&url={}",
                encode_query_url(&absolute)
            ));
            result.push('"');
            remaining = &remaining[end + 1..];
        } else {
            result.push_str(remaining);
            remaining = "";
        }
    }

    result.push_str(remaining);
    result
}

/// Error body in the engine's client shape, with an HTTP status attached.
pub fn error_response(status: StatusCode, err: &Error) -> Response {
    let body = err.to_client_json().to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x1234\n\
seg-001.ts\n\
seg-002.ts\n\
nested/low.m3u8\n\
https://cdn.example/abs-003.ts\n";

    #[test]
    fn rewrite_absolutizes_segments_and_proxies_keys() {
        let out = rewrite_m3u8(
            PLAYLIST,
            "https://media.example/live/playlist.m3u8",
            "http://127.0.0.1:9978",
        );

        assert!(out.contains("https://media.example/live/seg-001.ts"));
        assert!(out.contains("https://cdn.example/abs-003.ts"));
        assert!(out.contains(
            "URI=\"http://127.0.0.1:9978/proxy?do=stream&url=https%3A%2F%2Fmedia%2Eexample%2Flive%2Fkey%2Ebin\""
        ));
        assert!(out.contains("/m3u8?url=https%3A%2F%2Fmedia%2Eexample%2Flive%2Fnested%2Flow%2Em3u8"));
    }

    #[test]
    fn rewrite_leaves_plain_tags_untouched() {
        let out = rewrite_m3u8(
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n",
            "https://media.example/a.m3u8",
            "http://127.0.0.1:9978",
        );
        assert!(out.contains("#EXT-X-TARGETDURATION:6"));
    }
}
