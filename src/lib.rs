//! # Membank - Configurable Interaction Memory Store
//!
//! Persistence layer for agent/task/response interactions.
//!
//! Membank provides:
//! - Ranked free-text retrieval over recorded interactions
//! - Conversation thread reconstruction via parent links
//! - Rolling per-model performance analytics
//! - Interchangeable backends: a full-text-indexed PostgreSQL provider
//!   and an always-available flat-file fallback

pub mod entry;
pub mod config;
pub mod provider;
pub mod rank;
pub mod cache;
pub mod thread;
pub mod stats;
pub mod store;

// Re-exports for convenient access
pub use config::{ProviderKind, StoreConfig};
pub use entry::{DeleteFilter, MemoryEntry, NewEntry};
pub use provider::{ActiveProvider, Provider};
pub use rank::ScoredEntry;
pub use stats::{ModelPerformance, StatsSnapshot};
pub use store::MemoryStore;

/// Result type alias for membank operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for membank operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                Error::Connection("connection pool exhausted".to_string())
            }
            sqlx::Error::PoolClosed => Error::Connection("connection pool closed".to_string()),
            sqlx::Error::Io(e) => Error::Connection(e.to_string()),
            sqlx::Error::Tls(e) => Error::Connection(e.to_string()),
            sqlx::Error::Configuration(e) => Error::Configuration(e.to_string()),
            other => Error::Provider(other.to_string()),
        }
    }
}
