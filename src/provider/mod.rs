//! Backend providers - the persistence contract and its implementations
//!
//! Two backends implement [`Provider`]:
//! - [`RelationalProvider`]: PostgreSQL with a full-text index, the
//!   primary backend
//! - [`FallbackProvider`]: flat-file NDJSON store, degraded but always
//!   available
//!
//! Callers never branch on which backend is active: [`ActiveProvider`]
//! is a tagged enum chosen once at configuration time, and every
//! operation dispatches through it.

pub mod fallback;
pub mod relational;
pub mod schema;

pub use fallback::FallbackProvider;
pub use relational::RelationalProvider;

use crate::config::{ProviderKind, StoreConfig};
use crate::entry::{DeleteFilter, MemoryEntry, NewEntry};
use crate::stats::StatsSnapshot;
use crate::{Error, Result};
use async_trait::async_trait;

/// A raw query candidate: an entry plus the provider-native match
/// score, normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: MemoryEntry,
    pub match_score: f64,
}

/// Persistence contract implemented by every backend.
///
/// Inputs are validated by the store before they reach a provider;
/// implementations may assume entry invariants hold.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Persist one entry, returning it as stored with its
    /// backend-assigned id and timestamp.
    ///
    /// The returned entry comes out of the same call that commits, so a
    /// success always hands the caller exactly what the backend holds.
    async fn insert(&self, new: &NewEntry) -> Result<MemoryEntry>;

    /// Persist a batch atomically: either every entry commits or none.
    ///
    /// Returns the stored entries in input order.
    async fn insert_batch(&self, batch: &[NewEntry]) -> Result<Vec<MemoryEntry>>;

    /// Fetch one entry by id
    async fn fetch(&self, id: i64) -> Result<Option<MemoryEntry>>;

    /// Up to `candidate_limit` entries matching `text`, with scores
    async fn query(&self, text: &str, candidate_limit: usize) -> Result<Vec<Candidate>>;

    /// Every live entry in insertion (id) order
    async fn scan(&self) -> Result<Vec<MemoryEntry>>;

    /// Statistics computed from the backend, not from rolling counters
    async fn stats(&self) -> Result<StatsSnapshot> {
        let entries = self.scan().await?;
        Ok(crate::stats::Aggregator::from_entries(&entries).snapshot())
    }

    /// Delete every entry matching the filter, returning the exact
    /// count. An empty filter removes nothing.
    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64>;

    /// Reconstruct the conversation thread starting at `id`
    async fn thread(&self, id: i64, max_depth: usize) -> Result<Vec<MemoryEntry>> {
        crate::thread::resolve(self, id, max_depth).await
    }
}

/// The configured backend, chosen once at resolution time.
#[derive(Debug)]
pub enum ActiveProvider {
    Relational(RelationalProvider),
    Fallback(FallbackProvider),
}

impl ActiveProvider {
    /// Which kind of backend is active
    pub fn kind(&self) -> ProviderKind {
        match self {
            ActiveProvider::Relational(_) => ProviderKind::Relational,
            ActiveProvider::Fallback(_) => ProviderKind::Fallback,
        }
    }
}

#[async_trait]
impl Provider for ActiveProvider {
    async fn insert(&self, new: &NewEntry) -> Result<MemoryEntry> {
        match self {
            ActiveProvider::Relational(p) => p.insert(new).await,
            ActiveProvider::Fallback(p) => p.insert(new).await,
        }
    }

    async fn insert_batch(&self, batch: &[NewEntry]) -> Result<Vec<MemoryEntry>> {
        match self {
            ActiveProvider::Relational(p) => p.insert_batch(batch).await,
            ActiveProvider::Fallback(p) => p.insert_batch(batch).await,
        }
    }

    async fn fetch(&self, id: i64) -> Result<Option<MemoryEntry>> {
        match self {
            ActiveProvider::Relational(p) => p.fetch(id).await,
            ActiveProvider::Fallback(p) => p.fetch(id).await,
        }
    }

    async fn query(&self, text: &str, candidate_limit: usize) -> Result<Vec<Candidate>> {
        match self {
            ActiveProvider::Relational(p) => p.query(text, candidate_limit).await,
            ActiveProvider::Fallback(p) => p.query(text, candidate_limit).await,
        }
    }

    async fn scan(&self) -> Result<Vec<MemoryEntry>> {
        match self {
            ActiveProvider::Relational(p) => p.scan().await,
            ActiveProvider::Fallback(p) => p.scan().await,
        }
    }

    async fn stats(&self) -> Result<StatsSnapshot> {
        match self {
            ActiveProvider::Relational(p) => p.stats().await,
            ActiveProvider::Fallback(p) => p.stats().await,
        }
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<u64> {
        match self {
            ActiveProvider::Relational(p) => p.delete_where(filter).await,
            ActiveProvider::Fallback(p) => p.delete_where(filter).await,
        }
    }
}

/// Outcome of provider resolution: the opened backend plus whether the
/// store degraded from its configured choice.
#[derive(Debug)]
pub struct ResolvedProvider {
    pub provider: ActiveProvider,
    pub degraded: bool,
}

/// Open the backend the configuration names.
///
/// When the relational backend is unreachable at startup and a
/// `[fallback]` section is explicitly configured, the resolver degrades
/// to the fallback store and reports it through the `degraded` flag.
/// Without that section the connection failure propagates.
pub async fn resolve(config: &StoreConfig) -> Result<ResolvedProvider> {
    config.validate()?;
    match config.provider {
        ProviderKind::Fallback => {
            let path = config.fallback_or_default().storage_path;
            let provider = FallbackProvider::open(&path)?;
            tracing::info!(path = %path.display(), "opened fallback store");
            Ok(ResolvedProvider {
                provider: ActiveProvider::Fallback(provider),
                degraded: false,
            })
        }
        ProviderKind::Relational => {
            let conn = config.connection.as_ref().ok_or_else(|| {
                Error::Configuration(
                    "relational provider requires a [connection] section".to_string(),
                )
            })?;
            match RelationalProvider::connect(conn, config.op_timeout()).await {
                Ok(provider) => {
                    tracing::info!(host = %conn.host, database = %conn.database, "connected to relational backend");
                    Ok(ResolvedProvider {
                        provider: ActiveProvider::Relational(provider),
                        degraded: false,
                    })
                }
                Err(err @ (Error::Connection(_) | Error::Timeout(_))) => {
                    let Some(fallback) = &config.fallback else {
                        return Err(err);
                    };
                    tracing::warn!(
                        error = %err,
                        path = %fallback.storage_path.display(),
                        "relational backend unreachable, degrading to fallback store"
                    );
                    let provider = FallbackProvider::open(&fallback.storage_path)?;
                    Ok(ResolvedProvider {
                        provider: ActiveProvider::Fallback(provider),
                        degraded: true,
                    })
                }
                Err(err) => Err(err),
            }
        }
    }
}
