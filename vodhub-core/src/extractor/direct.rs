//! Zero-I/O extractors: direct media, stripped schemes, push targets.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Extraction, Extractor};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::spider::is_media_url;

/// Passes through `http(s)` URLs that already point at media.
pub struct DirectMediaExtractor;

#[async_trait]
impl Extractor for DirectMediaExtractor {
    fn name(&self) -> &str {
        "direct"
    }

    fn matches(&self, url: &str) -> bool {
        (url.starts_with("http://") || url.starts_with("https://")) && is_media_url(url)
    }

    async fn extract(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<Extraction> {
        Ok(Extraction::Resolved {
            url: url.to_string(),
            headers: headers.clone(),
        })
    }
}

/// `video://<payload>` — the payload is the play URL.
pub struct VideoSchemeExtractor;

#[async_trait]
impl Extractor for VideoSchemeExtractor {
    fn name(&self) -> &str {
        "video-scheme"
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with("video://")
    }

    async fn extract(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<Extraction> {
        Ok(Extraction::Resolved {
            url: url.trim_start_matches("video://").to_string(),
            headers: headers.clone(),
        })
    }
}

/// `push://<target>` — notifies listeners, nothing plays locally.
pub struct PushExtractor {
    events: EventBus,
}

impl PushExtractor {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Extractor for PushExtractor {
    fn name(&self) -> &str {
        "push"
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with("push://")
    }

    async fn extract(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<Extraction> {
        self.events.publish(EngineEvent::PushTarget {
            url: url.trim_start_matches("push://").to_string(),
        });
        Ok(Extraction::Empty)
    }
}
