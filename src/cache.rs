//! TTL + LRU cache
//!
//! An `lru::LruCache` keeps recency order; each entry also carries an expiry
//! instant. An entry is expired once `now > expires_at`, whether it is found
//! by a read or by the periodic sweep. Counters are atomics so `stats` never
//! has to take the map lock.

use crate::config::CacheConfig;
use crate::error::PipelineError;
use log::debug;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0 when nothing was looked up
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
}

pub struct TtlLruCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(config: &CacheConfig) -> Result<Self, PipelineError> {
        let capacity = NonZeroUsize::new(config.max_size).ok_or_else(|| {
            PipelineError::Configuration("cache.max_size must be at least 1".to_string())
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl: config.default_ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        })
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a live entry, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries();

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace; `ttl` of `None` uses the configured default
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        let mut entries = self.entries();

        if !entries.contains(&key) && entries.len() == entries.cap().get() {
            if entries.pop_lru().is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.put(key, CacheEntry { value, expires_at });
    }

    pub fn delete(&self, key: &K) -> bool {
        self.entries().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            self.expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!("purged {} expired cache entries", expired.len());
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize) -> TtlLruCache<String, u32> {
        TtlLruCache::new(&CacheConfig {
            max_size,
            default_ttl_ms: 5_000,
            cleanup_interval_ms: 60_000,
        })
        .unwrap()
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache(4);
        cache.set("a".to_string(), 1, None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        cache.set("a".to_string(), 2, None);
        assert_eq!(cache.get(&"a".to_string()), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = cache(2);
        cache.set("a".to_string(), 1, None);
        cache.set("b".to_string(), 2, None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.set("c".to_string(), 3, None);

        assert_eq!(cache.get(&"b".to_string()), None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"c".to_string()), Some(3));

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result = TtlLruCache::<String, u32>::new(&CacheConfig {
            max_size: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(4);
        cache.set("a".to_string(), 1, None);
        cache.set("b".to_string(), 2, None);
        assert!(cache.delete(&"a".to_string()));
        assert!(!cache.delete(&"a".to_string()));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = cache(4);
        cache.set("short".to_string(), 1, Some(Duration::from_millis(100)));
        cache.set("long".to_string(), 2, None);

        tokio::time::advance(Duration::from_millis(100)).await;
        // Exactly at the deadline is still live
        assert_eq!(cache.get(&"short".to_string()), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"short".to_string()), None);
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.get(&"long".to_string()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_sweeps() {
        let cache = cache(8);
        for i in 0..3 {
            cache.set(format!("k{i}"), i, Some(Duration::from_secs(1)));
        }
        cache.set("keep".to_string(), 99, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 3);
    }
}
