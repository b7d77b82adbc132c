use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{DiskTier, MemoryTier, DEFAULT_MEMORY_ENTRIES, DISK_HIGH_WATER_BYTES};
use crate::error::{Error, Result};

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub disk_bytes: u64,
}

/// Two-tier cache with a single-flight `get_or_compute`.
///
/// The disk tier is advisory: a disk write failure still leaves the memory
/// entry in place, and disk corruption on a key degrades to a miss.
pub struct CacheStore {
    memory: MemoryTier,
    disk: Option<Arc<DiskTier>>,
    flight: async_singleflight::Group<String, Bytes, Arc<Error>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStore {
    pub fn new(disk: Option<DiskTier>) -> Self {
        Self::with_capacity(DEFAULT_MEMORY_ENTRIES, disk)
    }

    pub fn with_capacity(memory_entries: usize, disk: Option<DiskTier>) -> Self {
        Self {
            memory: MemoryTier::new(memory_entries),
            disk: disk.map(Arc::new),
            flight: async_singleflight::Group::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a key, promoting a disk hit into memory.
    pub async fn get(&self, key: &str, ttl: Duration) -> Option<Bytes> {
        if let Some(value) = self.memory.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            let owned = key.to_string();
            let found = tokio::task::spawn_blocking(move || disk.get(&owned))
                .await
                .ok()
                .flatten();
            if let Some(value) = found {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.memory
                    .put(key.to_string(), value.clone(), Instant::now() + ttl);
                return Some(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn put(&self, key: &str, value: Bytes, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.memory
            .put(key.to_string(), value.clone(), Instant::now() + ttl);

        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            let owned = key.to_string();
            let write = tokio::task::spawn_blocking(move || disk.put(&owned, &value, ttl)).await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "disk cache write failed"),
                Err(e) => tracing::warn!(key = %key, error = %e, "disk cache write task failed"),
            }
        }
    }

    /// Single-flight load: concurrent callers with the same key share one
    /// loader execution and one outcome. Loader failures are not cached.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Bytes>> + Send,
    {
        if ttl.is_zero() {
            return loader().await;
        }
        if let Some(found) = self.get(key, ttl).await {
            return Ok(found);
        }

        let work = async {
            // Double-check under the flight: a racing leader may have
            // populated the key while this caller was queued.
            if let Some(found) = self.get(key, ttl).await {
                return Ok(found);
            }
            let value = loader().await.map_err(Arc::new)?;
            self.put(key, value.clone(), ttl).await;
            Ok(value)
        };

        self.flight
            .work(&key.to_string(), work)
            .await
            .map_err(|err| match err {
                Some(shared) => Arc::try_unwrap(shared).unwrap_or_else(|arc| arc.duplicate()),
                None => Error::Network("cache loader leader dropped".into()),
            })
    }

    pub async fn invalidate(&self, key: &str) {
        self.memory.invalidate(key);
        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            let owned = key.to_string();
            let _ = tokio::task::spawn_blocking(move || disk.invalidate(&owned)).await;
        }
    }

    pub async fn clear_expired(&self) {
        self.memory.clear_expired();
        if let Some(disk) = &self.disk {
            let disk = disk.clone();
            let _ = tokio::task::spawn_blocking(move || disk.clear_expired()).await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let disk_bytes = match &self.disk {
            Some(disk) => {
                let disk = disk.clone();
                tokio::task::spawn_blocking(move || disk.total_bytes())
                    .await
                    .unwrap_or(0)
            }
            None => 0,
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
            disk_bytes,
        }
    }

    /// Hourly maintenance: drop expired entries, then shrink the disk tier
    /// when it crosses the high-water mark.
    pub fn spawn_janitor(self: &Arc<Self>, cancel: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                store.clear_expired().await;
                if let Some(disk) = &store.disk {
                    let disk = disk.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        if disk.total_bytes() > DISK_HIGH_WATER_BYTES {
                            disk.evict_oldest(0.25);
                        }
                    })
                    .await;
                }
                tracing::debug!("cache janitor pass complete");
            }
        });
    }
}
