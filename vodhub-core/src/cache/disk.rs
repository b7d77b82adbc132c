//! On-disk cache tier
//!
//! Layout under the cache root:
//!   `data/<hash>`       — plain payloads
//!   `compressed/<hash>` — gzip payloads (written when payload > 1 MiB;
//!                         the plain file is removed)
//!
//! File format: 4-byte schema version prefix, 8-byte big-endian expiry
//! (unix seconds), then the payload. A file that fails to parse is deleted
//! and reported as a miss.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use super::COMPRESS_THRESHOLD_BYTES;
use crate::error::{Error, Result};

/// Schema version prefix; bump when the on-disk format changes.
const SCHEMA_MAGIC: [u8; 4] = *b"VHC1";

const HEADER_LEN: usize = SCHEMA_MAGIC.len() + 8;

/// Stable file name for a logical cache key.
pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(digest)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct DiskTier {
    data_dir: PathBuf,
    compressed_dir: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let data_dir = root.join("data");
        let compressed_dir = root.join("compressed");
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&compressed_dir)?;
        Ok(Self {
            data_dir,
            compressed_dir,
        })
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let name = hash_key(key);
        (self.data_dir.join(&name), self.compressed_dir.join(name))
    }

    /// Read a payload; expired or corrupt files are deleted and reported as
    /// a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let (plain, compressed) = self.paths(key);
        if let Some(found) = self.read_file(&plain, false) {
            return Some(found);
        }
        self.read_file(&compressed, true)
    }

    fn read_file(&self, path: &Path, compressed: bool) -> Option<Bytes> {
        let raw = fs::read(path).ok()?;
        match Self::decode(&raw, compressed) {
            Ok(Some(payload)) => Some(payload),
            Ok(None) => {
                // Expired.
                let _ = fs::remove_file(path);
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cache file removed");
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    fn decode(raw: &[u8], compressed: bool) -> Result<Option<Bytes>> {
        if raw.len() < HEADER_LEN || raw[..SCHEMA_MAGIC.len()] != SCHEMA_MAGIC {
            return Err(Error::Parse("bad cache file header".into()));
        }
        let mut expire = [0u8; 8];
        expire.copy_from_slice(&raw[SCHEMA_MAGIC.len()..HEADER_LEN]);
        let expire_at = u64::from_be_bytes(expire);
        if expire_at <= unix_now() {
            return Ok(None);
        }

        let body = &raw[HEADER_LEN..];
        if compressed {
            let mut decoder = GzDecoder::new(body);
            let mut payload = Vec::new();
            decoder
                .read_to_end(&mut payload)
                .map_err(|e| Error::Parse(format!("gzip payload unreadable: {e}")))?;
            Ok(Some(Bytes::from(payload)))
        } else {
            Ok(Some(Bytes::copy_from_slice(body)))
        }
    }

    /// Write a payload. Large payloads land compressed and the plain file is
    /// removed (and vice versa).
    pub fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let (plain, compressed) = self.paths(key);
        let expire_at = unix_now().saturating_add(ttl.as_secs().max(1));

        let mut file_body = Vec::with_capacity(HEADER_LEN + value.len().min(4096));
        file_body.extend_from_slice(&SCHEMA_MAGIC);
        file_body.extend_from_slice(&expire_at.to_be_bytes());

        if value.len() > COMPRESS_THRESHOLD_BYTES {
            let mut encoder = GzEncoder::new(&mut file_body, Compression::default());
            encoder.write_all(value)?;
            encoder.finish()?;
            fs::write(&compressed, &file_body)?;
            let _ = fs::remove_file(&plain);
        } else {
            file_body.extend_from_slice(value);
            fs::write(&plain, &file_body)?;
            let _ = fs::remove_file(&compressed);
        }
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        let (plain, compressed) = self.paths(key);
        let _ = fs::remove_file(plain);
        let _ = fs::remove_file(compressed);
    }

    fn files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for dir in [&self.data_dir, &self.compressed_dir] {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() {
                        out.push(path);
                    }
                }
            }
        }
        out
    }

    /// Delete files whose embedded expiry has passed.
    pub fn clear_expired(&self) {
        let now = unix_now();
        for path in self.files() {
            let expired = fs::File::open(&path)
                .ok()
                .and_then(|mut f| {
                    let mut header = [0u8; HEADER_LEN];
                    f.read_exact(&mut header).ok()?;
                    if header[..SCHEMA_MAGIC.len()] != SCHEMA_MAGIC {
                        return Some(true);
                    }
                    let mut expire = [0u8; 8];
                    expire.copy_from_slice(&header[SCHEMA_MAGIC.len()..]);
                    Some(u64::from_be_bytes(expire) <= now)
                })
                .unwrap_or(true);
            if expired {
                let _ = fs::remove_file(&path);
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files()
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Evict the oldest `fraction` of files by modification time.
    ///
    /// Last access is approximated by mtime; hot keys live in the memory
    /// tier, so cold disk files age out correctly in practice.
    pub fn evict_oldest(&self, fraction: f64) {
        let mut files: Vec<(PathBuf, SystemTime)> = self
            .files()
            .into_iter()
            .filter_map(|p| {
                let modified = fs::metadata(&p).ok()?.modified().ok()?;
                Some((p, modified))
            })
            .collect();
        files.sort_by_key(|(_, modified)| *modified);

        let victims = ((files.len() as f64) * fraction).ceil() as usize;
        for (path, _) in files.into_iter().take(victims) {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path()).expect("tier");

        tier.put("k", b"payload", Duration::from_secs(60)).expect("put");
        assert_eq!(tier.get("k").as_deref(), Some(b"payload".as_slice()));
    }

    #[test]
    fn expired_files_miss_and_are_deleted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path()).expect("tier");

        // TTL is clamped to at least one second, so write a file whose
        // embedded expiry is already in the past.
        let name = hash_key("old");
        let mut body = Vec::new();
        body.extend_from_slice(&SCHEMA_MAGIC);
        body.extend_from_slice(&1u64.to_be_bytes());
        body.extend_from_slice(b"stale");
        let path = dir.path().join("data").join(name);
        fs::write(&path, body).expect("write");

        assert!(tier.get("old").is_none());
        assert!(!path.exists(), "expired file should be deleted");
    }

    #[test]
    fn large_payloads_compress_and_decompress_transparently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path()).expect("tier");

        let big = vec![b'x'; COMPRESS_THRESHOLD_BYTES + 1];
        tier.put("big", &big, Duration::from_secs(60)).expect("put");

        let name = hash_key("big");
        assert!(dir.path().join("compressed").join(&name).exists());
        assert!(!dir.path().join("data").join(&name).exists());

        assert_eq!(tier.get("big").as_deref(), Some(big.as_slice()));
    }

    #[test]
    fn corrupt_files_are_removed_and_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path()).expect("tier");

        let path = dir.path().join("data").join(hash_key("bad"));
        fs::write(&path, b"not a cache file").expect("write");

        assert!(tier.get("bad").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn evict_oldest_removes_the_oldest_fraction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path()).expect("tier");

        for i in 0..4 {
            tier.put(&format!("k{i}"), b"v", Duration::from_secs(60)).expect("put");
            std::thread::sleep(Duration::from_millis(20));
        }
        tier.evict_oldest(0.25);

        let survivors: usize = (0..4).filter(|i| tier.get(&format!("k{i}")).is_some()).count();
        assert_eq!(survivors, 3);
        assert!(tier.get("k0").is_none(), "oldest entry should be evicted");
    }
}
