//! Memoization of expensive backend results.
//!
//! Entries carry their own TTL. Concurrent callers asking for the same key while
//! the value is being computed wait for that single computation instead of
//! starting their own, and all of them receive its result (success or error).
//! Inserts and evictions are atomic with respect to readers.

use crate::error::{CostError, Result};
use moka::Expiry;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    ttl: Duration,
}

struct PerEntryTtl;

impl<V> Expiry<String, Entry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache (including waiters on an in-flight computation).
    pub hits: u64,
    /// Lookups that ran the computation.
    pub misses: u64,
    /// Approximate number of live entries.
    pub entry_count: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

/// Single-flight TTL cache keyed by string.
pub struct ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<String, Entry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> std::fmt::Debug for ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entry_count", &self.inner.entry_count())
            .finish_non_exhaustive()
    }
}

impl<V> ResultCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `max_entries` values.
    #[must_use]
    pub fn new(max_entries: u64) -> Self {
        let inner = Cache::builder().max_capacity(max_entries).expire_after(PerEntryTtl).build();
        Self { inner, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    /// Returns the cached value for `key` if present and unexpired; otherwise runs
    /// `compute`, stores its value for `ttl`, and returns it.
    ///
    /// Errors are shared with concurrent waiters but never stored.
    ///
    /// # Errors
    /// Returns whatever `compute` failed with.
    pub async fn with_cache<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let computed = AtomicBool::new(false);
        let init = async {
            computed.store(true, Ordering::SeqCst);
            compute().await.map(|value| Entry { value, ttl })
        };

        let outcome = self.inner.try_get_with(key.to_string(), init).await;

        if computed.load(Ordering::SeqCst) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache miss, computed value");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit");
        }

        outcome.map(|entry| entry.value).map_err(|err: Arc<CostError>| (*err).clone())
    }

    /// Drops the entry for `key`, if any.
    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.inner.entry_count(),
        }
    }
}
