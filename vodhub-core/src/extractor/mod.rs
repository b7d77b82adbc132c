//! Play-URL extractor pipeline
//!
//! Scheme-dispatched transformers that turn a candidate play identifier
//! into something directly playable. Dispatch walks the registration order
//! and the first extractor claiming `matches(url)` wins; a URL nothing
//! claims is unresolved.

pub mod direct;
pub mod parser;
pub mod peer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::spider::vod::PlayResult;

pub use direct::{DirectMediaExtractor, PushExtractor, VideoSchemeExtractor};
pub use parser::ParserChainExtractor;
pub use peer::{
    LatchBackend, PeerBackend, ReadinessSignal, ServiceBoundExtractor, TorrentExtractor,
    TvBusExtractor,
};

/// Outcome of one extractor run.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// Directly playable URL.
    Resolved {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Client must still run a parser: `play_url` prefixes the target.
    HandOff { play_url: String, url: String },
    /// Side-effect only (e.g. push targets); nothing to play here.
    Empty,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, url: &str) -> bool;

    async fn extract(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Extraction>;

    /// Stop in-flight work for the current play request.
    async fn stop(&self) {}

    /// Release all backend resources.
    async fn exit(&self) {}
}

/// Ordered, single-shot-per-play pipeline.
pub struct ExtractorPipeline {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl ExtractorPipeline {
    pub fn new(extractors: Vec<Arc<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    /// Resolve a spider's play result into its final form.
    ///
    /// `parse == 1` results pass through untouched: the client was already
    /// told to run a parser. Unmatched URLs are an `ExtractorError`.
    pub async fn resolve(&self, play: PlayResult, cancel: &CancellationToken) -> Result<PlayResult> {
        if play.parse == 1 || play.url.is_empty() {
            return Ok(play);
        }

        let claimed = self.extractors.iter().find(|e| e.matches(&play.url));
        let Some(extractor) = claimed else {
            return Err(Error::Extractor(format!(
                "no extractor matched {}",
                play.url
            )));
        };

        tracing::debug!(extractor = extractor.name(), url = %play.url, "extracting");
        match extractor.extract(&play.url, &play.headers, cancel).await? {
            Extraction::Resolved { url, headers } => Ok(PlayResult {
                parse: 0,
                play_url: String::new(),
                url,
                headers,
                flag: play.flag,
            }),
            Extraction::HandOff { play_url, url } => Ok(PlayResult {
                parse: 1,
                play_url,
                url,
                headers: play.headers,
                flag: play.flag,
            }),
            Extraction::Empty => Ok(PlayResult {
                parse: 0,
                play_url: String::new(),
                url: String::new(),
                headers: HashMap::new(),
                flag: play.flag,
            }),
        }
    }

    /// Stop every extractor's in-flight work (play request superseded).
    pub async fn stop_all(&self) {
        for extractor in &self.extractors {
            extractor.stop().await;
        }
    }

    /// Tear down backend resources (config change or shutdown).
    pub async fn exit_all(&self) {
        for extractor in &self.extractors {
            extractor.exit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClaimAll(&'static str);

    #[async_trait]
    impl Extractor for ClaimAll {
        fn name(&self) -> &str {
            self.0
        }
        fn matches(&self, _url: &str) -> bool {
            true
        }
        async fn extract(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
            _cancel: &CancellationToken,
        ) -> Result<Extraction> {
            Ok(Extraction::Resolved {
                url: format!("resolved-by-{}", self.0),
                headers: HashMap::new(),
            })
        }
    }

    #[tokio::test]
    async fn first_registered_claimant_wins() {
        let pipeline = ExtractorPipeline::new(vec![
            Arc::new(ClaimAll("first")),
            Arc::new(ClaimAll("second")),
        ]);
        let play = PlayResult::direct("scheme://anything");
        let out = pipeline
            .resolve(play, &CancellationToken::new())
            .await
            .expect("resolve");
        assert_eq!(out.url, "resolved-by-first");
    }

    #[tokio::test]
    async fn unmatched_url_is_an_extractor_error() {
        let pipeline = ExtractorPipeline::new(Vec::new());
        let err = pipeline
            .resolve(PlayResult::direct("weird://x"), &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Extractor(_)));
    }

    #[tokio::test]
    async fn parse_one_results_pass_through() {
        let pipeline = ExtractorPipeline::new(vec![Arc::new(ClaimAll("never"))]);
        let play = PlayResult::needs_parser("https://page.example/v/1", "hd");
        let out = pipeline
            .resolve(play.clone(), &CancellationToken::new())
            .await
            .expect("resolve");
        assert_eq!(out, play);
    }
}
