//! Short-TTL response cache keyed by endpoint and canonical parameters.
//!
//! Entries expire when `now - stored_at > ttl`. Expired entries are evicted
//! lazily on read and by [`ResponseCache::sweep_expired`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::clock::Clock;

/// Cache key: endpoint plus sorted `key=value` parameter string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    endpoint: String,
    params: String,
}

impl CacheKey {
    /// Build a key from an endpoint and its parameters.
    #[must_use]
    pub fn new(endpoint: &str, params: &BTreeMap<String, String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            params: canonical_params(params),
        }
    }

    /// Endpoint component.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}?{}", self.endpoint, self.params)
    }
}

/// Render parameters as `a=1&b=2` in key order.
#[must_use]
pub fn canonical_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries (including not-yet-swept expired ones).
    pub entries: usize,
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that fell through.
    pub misses: u64,
    /// Entries removed by expiry, capacity or invalidation.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Thread-safe TTL cache of remote payloads.
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    /// Create an empty cache bounded to `max_entries`.
    #[must_use]
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    /// Fetch a live entry.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            Some(_) => {
                inner.entries.remove(key);
                inner.evictions += 1;
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Store a value. A zero TTL disables caching for the call.
    pub fn put(&self, key: CacheKey, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }

    /// Drop every entry for `endpoint`. Returns the number removed.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| key.endpoint != endpoint);
        let removed = before - inner.entries.len();
        inner.evictions += removed as u64;
        removed
    }

    /// Remove expired entries. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - inner.entries.len();
        inner.evictions += removed as u64;
        removed
    }

    /// Remove everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.evictions += removed as u64;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resilience::clock::ManualClock;

    fn key(endpoint: &str, code: &str) -> CacheKey {
        let mut params = BTreeMap::new();
        params.insert("stock_code".to_string(), code.to_string());
        CacheKey::new(endpoint, &params)
    }

    fn cache(max_entries: usize) -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (ResponseCache::new(max_entries, clock.clone()), clock)
    }

    #[test]
    fn test_canonical_params_are_sorted() {
        let mut params = BTreeMap::new();
        params.insert("b".to_string(), "2".to_string());
        params.insert("a".to_string(), "1".to_string());
        assert_eq!(canonical_params(&params), "a=1&b=2");
        assert_eq!(CacheKey::new("quote", &params).to_string(), "quote?a=1&b=2");
    }

    #[test]
    fn test_hit_within_ttl_and_expiry_after() {
        let (cache, clock) = cache(16);
        let value = json!({"ltp": 101.5});
        cache.put(key("quote", "NIFTY"), value.clone(), Duration::from_secs(5));

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get(&key("quote", "NIFTY")), Some(value));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&key("quote", "NIFTY")), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let (cache, _) = cache(16);
        cache.put(key("quote", "NIFTY"), json!(1), Duration::ZERO);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_full_cache_evicts_oldest() {
        let (cache, clock) = cache(2);
        cache.put(key("quote", "A"), json!("a"), Duration::from_secs(60));
        clock.advance(Duration::from_secs(1));
        cache.put(key("quote", "B"), json!("b"), Duration::from_secs(60));
        clock.advance(Duration::from_secs(1));
        cache.put(key("quote", "C"), json!("c"), Duration::from_secs(60));

        assert_eq!(cache.get(&key("quote", "A")), None);
        assert_eq!(cache.get(&key("quote", "C")), Some(json!("c")));
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_sweep_and_invalidate() {
        let (cache, clock) = cache(16);
        cache.put(key("quote", "A"), json!(1), Duration::from_secs(5));
        cache.put(key("funds", ""), json!(2), Duration::from_secs(60));
        cache.put(key("positions", ""), json!(3), Duration::from_secs(60));

        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.invalidate_endpoint("funds"), 1);
        assert_eq!(cache.stats().entries, 1);

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
