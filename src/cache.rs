//! Query result cache - bounded LRU with a time-to-live
//!
//! Keyed by the normalized query text plus the query parameters, so a
//! different limit or threshold never aliases a cached result. Every
//! successful write invalidates the whole cache rather than guessing
//! which cached queries a new entry could affect.
//!
//! Invalidation also advances a generation counter. A result computed
//! from a backend read must be published with the generation observed
//! before that read; when an invalidation lands in between, the publish
//! is discarded instead of resurrecting a pre-write result.

use crate::rank::ScoredEntry;
use crate::{Error, Result};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedResult {
    results: Vec<ScoredEntry>,
    expires_at: Instant,
}

/// Map and generation share one lock, so a stale-generation `put` can
/// never interleave with an invalidation's bump-and-clear.
struct CacheState {
    entries: LruCache<String, CachedResult>,
    generation: u64,
}

/// Bounded cache of ranked query results.
///
/// The lock is only held for map operations, never across I/O.
pub struct QueryCache {
    state: Mutex<CacheState>,
    ttl: Duration,
}

impl QueryCache {
    /// Create a cache holding at most `max_size` results, each fresh for `ttl`
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                generation: 0,
            }),
            ttl,
        }
    }

    /// Cache key for a query and its parameters.
    ///
    /// The text is lower-cased and whitespace-collapsed; `limit` and the
    /// exact bits of `min_relevance` are folded in so parameter changes
    /// never alias.
    pub fn key(text: &str, limit: usize, min_relevance: f64) -> String {
        let normalized: Vec<&str> = text.split_whitespace().collect();
        format!(
            "{}|{}|{:016x}",
            normalized.join(" ").to_lowercase(),
            limit,
            min_relevance.to_bits()
        )
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| Error::Provider("query cache lock poisoned".to_string()))
    }

    /// The current invalidation generation.
    ///
    /// Snapshot this before reading the backend and pass it to [`put`]:
    /// a generation that moved in between means a write invalidated the
    /// cache while the result was being computed.
    ///
    /// [`put`]: QueryCache::put
    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation)
    }

    /// Fetch a fresh cached result, evicting it when past its TTL
    pub fn get(&self, key: &str) -> Result<Option<Vec<ScoredEntry>>> {
        let mut state = self.lock()?;
        let expired = match state.entries.peek(key) {
            Some(cached) => Instant::now() >= cached.expires_at,
            None => return Ok(None),
        };
        if expired {
            state.entries.pop(key);
            tracing::debug!(key, "query cache entry expired");
            return Ok(None);
        }
        if let Some(cached) = state.entries.get(key) {
            tracing::debug!(key, "query cache hit");
            return Ok(Some(cached.results.clone()));
        }
        Ok(None)
    }

    /// Store a ranked result under `key`, unless the cache has been
    /// invalidated since `as_of` was snapshotted.
    pub fn put(&self, key: String, results: Vec<ScoredEntry>, as_of: u64) -> Result<()> {
        let mut state = self.lock()?;
        if state.generation != as_of {
            tracing::debug!(key, "discarding query result computed before an invalidation");
            return Ok(());
        }
        state.entries.put(
            key,
            CachedResult {
                results,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    /// Drop every cached result and advance the generation; called
    /// after any successful write
    pub fn invalidate_all(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.generation += 1;
        state.entries.clear();
        Ok(())
    }
}
