//! Scan Result Cache
//!
//! Content-addressed cache of scan results. Keys combine the SHA-256
//! fingerprint of the skill source with the semantic model id, so scan cost
//! is O(unique content) and a model change starts a fresh generation.
//!
//! Concurrent first-time lookups of one key run a single computation; every
//! waiter receives its result (or its error, which is not cached).

use moka::future::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::scanner::ScanResult;

/// Cache key: content fingerprint + analyzer revision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub fingerprint: String,
    pub revision: String,
}

impl ScanKey {
    pub fn new(fingerprint: &str, revision: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            revision: revision.to_string(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

/// Shared, injectable scan cache
#[derive(Clone)]
pub struct ScanCache {
    cache: Cache<ScanKey, ScanResult>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ScanCache {
    /// Create new cache with capacity and TTL
    pub fn new(max_entries: u64, ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get cached result
    pub async fn get(&self, key: &ScanKey) -> Option<ScanResult> {
        self.cache.get(key).await
    }

    /// Get the cached result or compute it exactly once per key.
    ///
    /// Returns the result and whether it came from the cache. An `Err` from
    /// `init` is shared with concurrent waiters and leaves no entry behind.
    pub async fn get_or_compute<F, E>(&self, key: ScanKey, init: F) -> Result<(ScanResult, bool), Arc<E>>
    where
        F: Future<Output = Result<ScanResult, E>>,
        E: Send + Sync + 'static,
    {
        let short = short_key(&key.fingerprint).to_string();
        let entry = self.cache.entry(key).or_try_insert_with(init).await?;

        if entry.is_fresh() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Scan cache MISS: {}", short);
            Ok((entry.into_value(), false))
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Scan cache HIT: {}", short);
            Ok((entry.into_value(), true))
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

}

impl Default for ScanCache {
    fn default() -> Self {
        Self::new(10_000, 24 * 3600)
    }
}

fn short_key(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(16)]
}
