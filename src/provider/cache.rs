//! TTL request cache
//!
//! Keyed by the full request identity (see `PageQuery::cache_key`).
//! Expired entries are treated as absent and removed lazily on access.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub payload: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Counters reported by the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    stats: CacheStats,
}

#[derive(Debug)]
pub struct RequestCache<V> {
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
}

impl<V: Clone> RequestCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let payload = entry.payload.clone();
                inner.stats.hits += 1;
                return Some(payload);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.evictions += 1;
        }
        inner.stats.misses += 1;
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut inner = self.lock();
        inner.entries.insert(
            key.into(),
            CacheEntry {
                payload: value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Insert using the cache's configured TTL
    pub fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<V>> {
        // A poisoned cache only ever holds plain data; keep serving it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_get_after_set_before_ttl() {
        let cache = RequestCache::new(Duration::from_secs(60));
        cache.set("k", 42u32, Duration::from_millis(500));

        advance(Duration::from_millis(499)).await;
        assert_eq!(cache.get("k"), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_ttl_is_absent_and_evicted() {
        let cache = RequestCache::new(Duration::from_secs(60));
        cache.set("k", "payload".to_string(), Duration::from_millis(500));

        advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_refreshes_ttl() {
        let cache = RequestCache::new(Duration::from_millis(100));
        cache.set_default("k", 1u8);
        advance(Duration::from_millis(80)).await;
        cache.set_default("k", 2u8);
        advance(Duration::from_millis(80)).await;

        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn test_clear_and_stats() {
        let cache = RequestCache::new(Duration::from_secs(60));
        cache.set_default("a", 1u8);
        cache.set_default("b", 2u8);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.get("a"), None);
    }
}
