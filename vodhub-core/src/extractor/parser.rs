//! Parser-chain extractor
//!
//! The default arm of the pipeline: play URLs that are not direct media and
//! carry no special scheme go through the config's parser list. JSON
//! parsers are resolved server-side; sniff/ext/mix/god parsers are handed
//! off to the client with the parser URL prefixed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Extraction, Extractor};
use crate::config::{Parser, ParserType};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;

/// Run one JSON parser against a target URL, returning its decoded reply.
pub async fn run_json_parser(
    fetcher: &Fetcher,
    parser: &Parser,
    target: &str,
    cancel: &CancellationToken,
) -> Result<Value> {
    let url = format!(
        "{}{}",
        parser.url,
        percent_encoding::utf8_percent_encode(target, percent_encoding::NON_ALPHANUMERIC)
    );
    let reply: Value = fetcher
        .get_json(&url, parser.headers(), Duration::from_secs(15), cancel)
        .await?;

    let resolved = reply
        .get("url")
        .or_else(|| reply.get("data").and_then(|d| d.get("url")))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if resolved.is_empty() || !resolved.starts_with("http") {
        return Err(Error::Extractor(format!(
            "parser {} returned no playable url",
            parser.name
        )));
    }
    Ok(reply)
}

/// Extract the resolved URL and optional headers from a parser reply.
pub fn parsed_url_and_headers(reply: &Value) -> (String, HashMap<String, String>) {
    let url = reply
        .get("url")
        .or_else(|| reply.get("data").and_then(|d| d.get("url")))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let headers = reply
        .get("header")
        .or_else(|| reply.get("headers"))
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    (url, headers)
}

/// Concurrent parser-resolution bound.
const PARSE_POOL: usize = 4;

pub struct ParserChainExtractor {
    fetcher: Arc<Fetcher>,
    parsers: Vec<Parser>,
    pool: tokio::sync::Semaphore,
}

impl ParserChainExtractor {
    pub fn new(fetcher: Arc<Fetcher>, parsers: Vec<Parser>) -> Self {
        Self {
            fetcher,
            parsers,
            pool: tokio::sync::Semaphore::new(PARSE_POOL),
        }
    }

    /// Parsers claiming the given flag first, then the rest, config order
    /// preserved within each group.
    fn ordered_for_flag(&self, flag: &str) -> Vec<&Parser> {
        let (claiming, rest): (Vec<&Parser>, Vec<&Parser>) = self
            .parsers
            .iter()
            .partition(|p| !flag.is_empty() && p.claims_flag(flag));
        claiming.into_iter().chain(rest).collect()
    }

    /// Resolve through the chain for a given flag; first success wins.
    pub async fn resolve_for_flag(
        &self,
        url: &str,
        flag: &str,
        cancel: &CancellationToken,
    ) -> Result<Extraction> {
        if self.parsers.is_empty() {
            return Err(Error::Extractor("no parsers configured".into()));
        }
        let _permit = self.pool.acquire().await.map_err(|_| Error::Cancelled)?;

        let mut failures = 0usize;
        for parser in self.ordered_for_flag(flag) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match parser.parser_type {
                ParserType::Json => {
                    match run_json_parser(&self.fetcher, parser, url, cancel).await {
                        Ok(reply) => {
                            let (resolved, headers) = parsed_url_and_headers(&reply);
                            tracing::debug!(parser = %parser.name, "parser resolved play url");
                            return Ok(Extraction::Resolved {
                                url: resolved,
                                headers,
                            });
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            failures += 1;
                            tracing::debug!(parser = %parser.name, error = %e, "parser failed");
                        }
                    }
                }
                // Sniffing and scripted parsers need a web view; hand the
                // prefixed URL to the client.
                ParserType::Sniff | ParserType::ExtJson | ParserType::Mix | ParserType::God => {
                    return Ok(Extraction::HandOff {
                        play_url: parser.url.clone(),
                        url: url.to_string(),
                    });
                }
            }
        }

        Err(Error::Extractor(format!(
            "all {failures} parsers failed for {url}"
        )))
    }
}

#[async_trait]
impl Extractor for ParserChainExtractor {
    fn name(&self) -> &str {
        "parser-chain"
    }

    /// Default arm: any plain http(s) URL that reached this point.
    fn matches(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    async fn extract(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Extraction> {
        self.resolve_for_flag(url, "", cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetcherConfig;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::Router;

    async fn fixture() -> String {
        let router = Router::new()
            .route(
                "/jx",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let target = q.get("url").cloned().unwrap_or_default();
                    if target.contains("known") {
                        axum::Json(serde_json::json!({
                            "url": "https://cdn.example/real.m3u8",
                            "header": {"Referer": "https://jx.example/"}
                        }))
                    } else {
                        axum::Json(serde_json::json!({"url": ""}))
                    }
                }),
            )
            .route("/dead", get(|| async { axum::Json(serde_json::json!({"msg": "nope"})) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn parser(name: &str, ptype: i64, url: String) -> Parser {
        serde_json::from_value(serde_json::json!({
            "name": name, "type": ptype, "url": url
        }))
        .expect("parser")
    }

    #[tokio::test]
    async fn json_parser_resolves_first_success() {
        let base = fixture().await;
        let fetcher = Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher"));
        let chain = ParserChainExtractor::new(
            fetcher,
            vec![
                parser("dead", 1, format!("{base}/dead?url=")),
                parser("good", 1, format!("{base}/jx?url=")),
            ],
        );

        let out = chain
            .resolve_for_flag("https://page.example/known/1", "", &CancellationToken::new())
            .await
            .expect("resolve");
        match out {
            Extraction::Resolved { url, headers } => {
                assert_eq!(url, "https://cdn.example/real.m3u8");
                assert_eq!(headers.get("Referer").map(String::as_str), Some("https://jx.example/"));
            }
            other => panic!("unexpected extraction: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sniff_parser_hands_off_to_client() {
        let fetcher = Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher"));
        let chain = ParserChainExtractor::new(
            fetcher,
            vec![parser("sniffer", 0, "https://sniff.example/?url=".to_string())],
        );
        let out = chain
            .resolve_for_flag("https://page.example/v/1", "", &CancellationToken::new())
            .await
            .expect("resolve");
        assert_eq!(
            out,
            Extraction::HandOff {
                play_url: "https://sniff.example/?url=".to_string(),
                url: "https://page.example/v/1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn all_parsers_failing_surfaces_extractor_error() {
        let base = fixture().await;
        let fetcher = Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher"));
        let chain = ParserChainExtractor::new(
            fetcher,
            vec![parser("dead", 1, format!("{base}/dead?url="))],
        );
        let err = chain
            .resolve_for_flag("https://page.example/v/1", "", &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Extractor(_)));
    }

    #[tokio::test]
    async fn flag_claiming_parser_is_consulted_first() {
        let base = fixture().await;
        let fetcher = Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher"));
        let claiming: Parser = serde_json::from_value(serde_json::json!({
            "name": "vip", "type": 1, "url": format!("{base}/jx?url="),
            "ext": {"flag": ["qiyi"]}
        }))
        .expect("parser");
        let chain = ParserChainExtractor::new(
            fetcher,
            vec![parser("dead", 1, format!("{base}/dead?url=")), claiming],
        );

        let out = chain
            .resolve_for_flag("https://page.example/known/2", "qiyi", &CancellationToken::new())
            .await
            .expect("resolve");
        assert!(matches!(out, Extraction::Resolved { .. }));
    }
}
