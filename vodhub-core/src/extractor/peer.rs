//! Peer-backend extractors
//!
//! Torrent, JianPian, TVBus and service-bound peers are external backends
//! that download or relay the resource and publish a local HTTP URL. Each
//! backend style gets its own completion shape: a plain async call for
//! download-style backends, a one-shot completion channel for latch-style
//! backends, and a readiness signal for service-bound ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{Extraction, Extractor};
use crate::error::{Error, Result};

/// How long an extractor waits for its backend before giving up.
const BACKEND_DEADLINE: Duration = Duration::from_secs(30);

/// Download-style backend: publish the resource, answer with a local URL.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, url: &str, cancel: &CancellationToken) -> Result<String>;

    async fn stop(&self) {}

    async fn exit(&self) {}
}

/// Latch-style backend: starts asynchronously and completes exactly once
/// with a local URL or an error. Dropping the sender cancels the wait.
pub trait LatchBackend: Send + Sync {
    fn name(&self) -> &str;

    fn begin(&self, url: &str) -> oneshot::Receiver<Result<String>>;

    fn stop(&self);
}

/// Extractor backed by a [`PeerBackend`], claiming a fixed scheme set.
pub struct TorrentExtractor {
    schemes: &'static [&'static str],
    label: &'static str,
    backend: Option<Arc<dyn PeerBackend>>,
}

impl TorrentExtractor {
    /// `magnet:` / `ed2k:` / `thunder:` via a torrent backend.
    pub fn torrent(backend: Option<Arc<dyn PeerBackend>>) -> Self {
        Self {
            schemes: &["magnet:", "ed2k:", "thunder:"],
            label: "torrent",
            backend,
        }
    }

    /// `tvbox-xg://` / `jianpian://` / `ftp://` via a JianPian peer backend.
    pub fn jianpian(backend: Option<Arc<dyn PeerBackend>>) -> Self {
        Self {
            schemes: &["tvbox-xg://", "jianpian://", "ftp://"],
            label: "jianpian",
            backend,
        }
    }
}

#[async_trait]
impl Extractor for TorrentExtractor {
    fn name(&self) -> &str {
        self.label
    }

    fn matches(&self, url: &str) -> bool {
        self.schemes.iter().any(|s| url.starts_with(s))
    }

    async fn extract(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Extraction> {
        let Some(backend) = &self.backend else {
            return Err(Error::Extractor(format!(
                "{} backend not available",
                self.label
            )));
        };

        let publish = backend.publish(url, cancel);
        let local = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(BACKEND_DEADLINE, publish) => {
                result.map_err(|_| Error::Timeout(format!("{} backend", self.label)))??
            }
        };
        Ok(Extraction::Resolved {
            url: local,
            headers: HashMap::new(),
        })
    }

    async fn stop(&self) {
        if let Some(backend) = &self.backend {
            backend.stop().await;
        }
    }

    async fn exit(&self) {
        if let Some(backend) = &self.backend {
            backend.exit().await;
        }
    }
}

/// `tvbus://` extractor: waits on the backend's one-shot completion until
/// an hls URL is produced.
pub struct TvBusExtractor {
    backend: Option<Arc<dyn LatchBackend>>,
}

impl TvBusExtractor {
    pub fn new(backend: Option<Arc<dyn LatchBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Extractor for TvBusExtractor {
    fn name(&self) -> &str {
        "tvbus"
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with("tvbus://")
    }

    async fn extract(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Extraction> {
        let Some(backend) = &self.backend else {
            return Err(Error::Extractor("tvbus backend not available".into()));
        };

        let completion = backend.begin(url);
        let local = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                backend.stop();
                return Err(Error::Cancelled);
            }
            result = tokio::time::timeout(BACKEND_DEADLINE, completion) => {
                match result {
                    Err(_) => {
                        backend.stop();
                        return Err(Error::Timeout("tvbus backend".into()));
                    }
                    Ok(Err(_)) => return Err(Error::Extractor("tvbus backend dropped".into())),
                    Ok(Ok(inner)) => inner?,
                }
            }
        };
        Ok(Extraction::Resolved {
            url: local,
            headers: HashMap::new(),
        })
    }

    async fn stop(&self) {
        if let Some(backend) = &self.backend {
            backend.stop();
        }
    }
}

/// Readiness handle for service-bound backends: the embedder flips it once
/// the peer service is bound.
#[derive(Clone)]
pub struct ReadinessSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessSignal {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn set_ready(&self) {
        let _ = self.tx.send(true);
    }
}

/// `p2p://` / `mitv://` extractor over a backend that binds asynchronously;
/// extraction awaits readiness with a timeout before publishing.
pub struct ServiceBoundExtractor {
    backend: Arc<dyn PeerBackend>,
    ready: watch::Receiver<bool>,
}

impl ServiceBoundExtractor {
    pub fn new(backend: Arc<dyn PeerBackend>, ready: watch::Receiver<bool>) -> Self {
        Self { backend, ready }
    }

    async fn await_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        if *ready.borrow() {
            return Ok(());
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    return Err(Error::Extractor("peer service dropped".into()));
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::Timeout("peer service bind".into()))?
    }
}

#[async_trait]
impl Extractor for ServiceBoundExtractor {
    fn name(&self) -> &str {
        "peer-service"
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with("p2p://") || url.starts_with("mitv://")
    }

    async fn extract(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Extraction> {
        self.await_ready().await?;
        let local = self.backend.publish(url, cancel).await?;
        Ok(Extraction::Resolved {
            url: local,
            headers: HashMap::new(),
        })
    }

    async fn stop(&self) {
        self.backend.stop().await;
    }

    async fn exit(&self) {
        self.backend.exit().await;
    }
}
