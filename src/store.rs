//! The memory store facade
//!
//! [`MemoryStore`] owns the active provider, the query result cache,
//! and the rolling analytics counters, and exposes the public
//! operations: insert, ranked query, thread reconstruction, statistics,
//! filtered delete, and cleanup.
//!
//! Every write holds one async gate across the provider call and the
//! counter update, so the rolling statistics always agree with what a
//! fresh backend scan would report.

use crate::cache::QueryCache;
use crate::config::{ProviderKind, StoreConfig};
use crate::entry::{DeleteFilter, MemoryEntry, NewEntry};
use crate::provider::{self, ActiveProvider, Provider};
use crate::rank::{self, ScoredEntry};
use crate::stats::{Aggregator, ModelPerformance, StatsSnapshot};
use crate::{Error, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Rolling counters plus a flag marking them out of date.
///
/// `stale` is set when a post-delete re-seed scan fails; the next
/// stats read re-seeds before reporting, so diverged counters are
/// never served.
struct Counters {
    aggregator: Aggregator,
    stale: bool,
}

/// Configurable interaction memory store.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
pub struct MemoryStore {
    provider: ActiveProvider,
    cache: QueryCache,
    counters: Mutex<Counters>,
    degraded: bool,
}

impl MemoryStore {
    /// Open the store described by `config`.
    ///
    /// Resolves the provider (degrading to the fallback store when the
    /// relational backend is unreachable and a fallback is configured)
    /// and seeds the rolling counters from a full backend scan.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let resolved = provider::resolve(&config).await?;
        let entries = resolved.provider.scan().await?;
        let aggregator = Aggregator::from_entries(&entries);
        tracing::info!(
            provider = %resolved.provider.kind(),
            degraded = resolved.degraded,
            entries = entries.len(),
            "memory store opened"
        );
        Ok(Self {
            provider: resolved.provider,
            cache: QueryCache::new(
                config.cache.max_size,
                Duration::from_secs(config.cache.ttl_seconds),
            ),
            counters: Mutex::new(Counters {
                aggregator,
                stale: false,
            }),
            degraded: resolved.degraded,
        })
    }

    /// True when the store fell back from its configured backend
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Which backend is live
    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Record one interaction, returning its assigned id.
    ///
    /// Validation failures surface before any storage I/O and leave the
    /// store untouched. The counters are fed the entry the provider's
    /// commit returned, so a success never leaves them behind storage.
    pub async fn add_entry(&self, new: NewEntry) -> Result<i64> {
        new.validate()?;
        let mut counters = self.counters.lock().await;
        let entry = self.provider.insert(&new).await?;
        counters.aggregator.record(&entry);
        self.cache.invalidate_all()?;
        tracing::debug!(id = entry.id, agent = %entry.agent_name, "recorded entry");
        Ok(entry.id)
    }

    /// Record a batch of interactions atomically.
    ///
    /// The whole batch is validated first and persisted in one
    /// transaction: one bad entry means nothing is committed.
    pub async fn add_entries(&self, batch: Vec<NewEntry>) -> Result<Vec<i64>> {
        for new in &batch {
            new.validate()?;
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut counters = self.counters.lock().await;
        let entries = self.provider.insert_batch(&batch).await?;
        for entry in &entries {
            counters.aggregator.record(entry);
        }
        self.cache.invalidate_all()?;
        tracing::debug!(count = entries.len(), "recorded entry batch");
        Ok(entries.into_iter().map(|entry| entry.id).collect())
    }

    /// Fetch one entry by id
    pub async fn get_entry(&self, id: i64) -> Result<Option<MemoryEntry>> {
        self.provider.fetch(id).await
    }

    /// Ranked free-text retrieval.
    ///
    /// Results carry a combined relevance in [0, 1]; entries scoring
    /// below `min_relevance` are dropped and at most `limit` results
    /// return, best first. Identical queries between writes are served
    /// from the cache with identical scores.
    pub async fn query(
        &self,
        text: &str,
        limit: usize,
        min_relevance: f64,
    ) -> Result<Vec<ScoredEntry>> {
        let key = QueryCache::key(text, limit, min_relevance);
        if let Some(cached) = self.cache.get(&key)? {
            return Ok(cached);
        }

        // snapshot before the backend read: a write that invalidates
        // while we compute makes the publish below a no-op
        let as_of = self.cache.generation()?;
        let candidate_limit = limit.saturating_mul(rank::CANDIDATE_FACTOR);
        let candidates = self.provider.query(text, candidate_limit).await?;
        let ranked = rank::rank(candidates, min_relevance, limit, Utc::now());
        tracing::debug!(text, results = ranked.len(), "ranked query");
        self.cache.put(key, ranked.clone(), as_of)?;
        Ok(ranked)
    }

    /// Summary statistics from the rolling counters.
    ///
    /// Counters left stale by a failed post-delete re-seed are
    /// refreshed from a full backend scan before reporting.
    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let mut counters = self.counters.lock().await;
        if counters.stale {
            let entries = self.provider.scan().await?;
            counters.aggregator = Aggregator::from_entries(&entries);
            counters.stale = false;
        }
        Ok(counters.aggregator.snapshot())
    }

    /// Condensed per-model analytics
    pub async fn model_performance(&self) -> Result<ModelPerformance> {
        Ok(self.stats().await?.model_performance())
    }

    /// Reconstruct the conversation thread starting at `id`.
    ///
    /// Bounded by `max_depth`; cycles and dangling links end the walk
    /// and return the partial thread.
    pub async fn thread(&self, id: i64, max_depth: usize) -> Result<Vec<MemoryEntry>> {
        self.provider.thread(id, max_depth).await
    }

    /// Delete every entry matching the filter, returning the exact
    /// count removed.
    ///
    /// After a removal the query cache is dropped and the rolling
    /// counters are re-seeded from a full backend scan. When that scan
    /// fails the counters are marked stale instead, and the next stats
    /// read re-seeds before reporting.
    pub async fn delete_where(&self, filter: DeleteFilter) -> Result<u64> {
        if filter.is_empty() {
            return Err(Error::Validation(
                "delete filter must set at least one condition".to_string(),
            ));
        }
        let mut counters = self.counters.lock().await;
        let removed = self.provider.delete_where(&filter).await?;
        if removed > 0 {
            self.cache.invalidate_all()?;
            match self.provider.scan().await {
                Ok(entries) => {
                    counters.aggregator = Aggregator::from_entries(&entries);
                    counters.stale = false;
                }
                Err(err) => {
                    counters.stale = true;
                    tracing::warn!(error = %err, "re-seed scan failed after delete; counters refresh on next stats read");
                }
            }
        }
        Ok(removed)
    }

    /// Remove stale low-value entries.
    ///
    /// An entry goes only when it is both older than `days_old` days
    /// and rated below `min_rating`: a well-rated old entry stays, and
    /// so does a recent failure.
    pub async fn cleanup(&self, days_old: u32, min_rating: u8) -> Result<u64> {
        let removed = self
            .delete_where(
                DeleteFilter::new()
                    .older_than_days(days_old)
                    .rating_below(min_rating),
            )
            .await?;
        tracing::info!(days_old, min_rating, removed, "cleanup complete");
        Ok(removed)
    }
}
