use std::num::NonZeroUsize;
use std::time::Instant;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

struct MemEntry {
    value: Bytes,
    expire_at: Instant,
}

/// In-memory LRU tier. O(1) get/put with recency update; expired entries are
/// never returned.
pub struct MemoryTier {
    entries: Mutex<LruCache<String, MemEntry>>,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expire_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: Bytes, expire_at: Instant) {
        self.entries.lock().put(key, MemEntry { value, expire_at });
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().pop(key);
    }

    pub fn clear_expired(&self) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expire_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let tier = MemoryTier::new(2);
        let later = Instant::now() + Duration::from_secs(60);
        tier.put("a".into(), Bytes::from_static(b"1"), later);
        tier.put("b".into(), Bytes::from_static(b"2"), later);

        // Touch "a" so "b" is the LRU victim.
        assert!(tier.get("a").is_some());
        tier.put("c".into(), Bytes::from_static(b"3"), later);

        assert!(tier.get("a").is_some());
        assert!(tier.get("b").is_none());
        assert!(tier.get("c").is_some());
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let tier = MemoryTier::new(4);
        tier.put(
            "gone".into(),
            Bytes::from_static(b"x"),
            Instant::now() - Duration::from_secs(1),
        );
        assert!(tier.get("gone").is_none());
        assert!(tier.is_empty());
    }
}
