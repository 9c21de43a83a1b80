//! LRU cache for verified tokens.
//!
//! Caches the subject extracted from a token whose signature and claims have
//! already been checked, so repeated requests with the same token skip the
//! RSA verification. Entries are keyed by the SHA-256 of the token and are
//! never served past the token's own expiry.

use super::Subject;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Token digest used as cache key.
type TokenDigest = [u8; 32];

/// Default cache capacity.
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Clone)]
struct CachedSubject {
    subject: Subject,
    expires_at: i64,
}

/// LRU cache of verified tokens.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Mutex<LruCache<TokenDigest, CachedSubject>>>,
    stats: Arc<Mutex<CacheStats>>,
}

/// Cache statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (including expired entries).
    pub misses: u64,
    /// Number of entries added.
    pub additions: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

fn digest(token: &str) -> TokenDigest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

impl TokenCache {
    /// Create a new cache with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new cache with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(CacheStats::default())),
        }
    }

    /// Look up a token, returning its subject if still valid at `now`
    /// (unix seconds). Expired entries are evicted.
    pub fn get(&self, token: &str, now: i64) -> Option<Subject> {
        let key = digest(token);
        let mut cache = self.inner.lock();
        let found = match cache.get(&key) {
            Some(entry) if entry.expires_at > now => Some(entry.subject.clone()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        };
        drop(cache);

        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        found
    }

    /// Remember a verified token until `expires_at` (unix seconds).
    pub fn insert(&self, token: &str, subject: Subject, expires_at: i64) {
        self.inner.lock().put(
            digest(token),
            CachedSubject {
                subject,
                expires_at,
            },
        );
        self.stats.lock().additions += 1;
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Get the current number of entries in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}
