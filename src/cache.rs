//! Summary cache with a pluggable backing store and an explicit TTL.
//!
//! Keys are content hashes, so a re-uploaded identical document hits the
//! same entry. The default store is an in-process LRU suitable for
//! single-instance deployments; multi-instance deployments would swap in an
//! external key-value store behind the same trait.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Backing store seam. Implementations must be cheap to call; values are
/// whole summary strings.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: String, value: String);
}

/// In-process LRU store with per-entry TTL.
pub struct LruTtlStore {
    inner: Mutex<LruCache<String, (Instant, String)>>,
    ttl: Duration,
}

impl LruTtlStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }
}

impl CacheStore for LruTtlStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut cache = self.inner.lock().ok()?;
        match cache.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                // Expired: drop it so the slot is reusable.
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: String) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, (Instant::now(), value));
        }
    }
}

/// Cache facade used by the summarization path.
pub struct SummaryCache {
    store: Box<dyn CacheStore>,
}

impl SummaryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            store: Box::new(LruTtlStore::new(capacity, ttl)),
        }
    }

    pub fn with_store(store: Box<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn put(&self, key: String, value: String) {
        self.store.put(key, value);
    }
}

/// Cache key derived from the document, the operation kind, and a hash of
/// the context text.
pub fn summary_key(document_id: &str, kind: &str, context_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(kind.as_bytes());
    hasher.update(b"\x00");
    hasher.update(context_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let store = LruTtlStore::new(4, Duration::from_secs(60));
        store.put("k".to_string(), "v".to_string());
        assert_eq!(store.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn miss_after_ttl() {
        let store = LruTtlStore::new(4, Duration::from_millis(0));
        store.put("k".to_string(), "v".to_string());
        // ttl = 0 means every entry is already expired.
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn lru_evicts_oldest() {
        let store = LruTtlStore::new(2, Duration::from_secs(60));
        store.put("a".to_string(), "1".to_string());
        store.put("b".to_string(), "2".to_string());
        store.put("c".to_string(), "3".to_string());
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b").as_deref(), Some("2"));
        assert_eq!(store.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn key_depends_on_all_parts() {
        let base = summary_key("doc1", "summary", "text");
        assert_ne!(base, summary_key("doc2", "summary", "text"));
        assert_ne!(base, summary_key("doc1", "outline", "text"));
        assert_ne!(base, summary_key("doc1", "summary", "other"));
        assert_eq!(base, summary_key("doc1", "summary", "text"));
    }
}
