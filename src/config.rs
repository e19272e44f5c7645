//! Store configuration - validated once, immutable afterwards
//!
//! Configuration arrives as TOML (or is built directly by library
//! callers), is validated by [`StoreConfig::validate`], and never
//! changes after the store opens. Invalid combinations fail fast with
//! [`Error::Configuration`] instead of surfacing later as runtime
//! surprises.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which backend the store should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// PostgreSQL with a full-text index, the primary backend
    Relational,
    /// Flat-file store, degraded but always available
    Fallback,
}

impl ProviderKind {
    /// Get the string representation of the provider kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Relational => "relational",
            ProviderKind::Fallback => "fallback",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" | "pg" => Ok(ProviderKind::Relational),
            "fallback" | "file" | "flat" => Ok(ProviderKind::Fallback),
            _ => Err(Error::Configuration(format!("Unknown provider kind: {}", s))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_pool_timeout_secs() -> u64 {
    5
}

/// Connection parameters for the relational backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database server host
    pub host: String,
    /// Database server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name
    pub database: String,
    /// Role to connect as
    pub user: String,
    /// Role password, empty for trust/peer auth
    #[serde(default)]
    pub password: String,
    /// libpq-style ssl mode: disable, allow, prefer, require, verify-ca, verify-full
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Seconds to wait for a free connection before giving up
    #[serde(default = "default_pool_timeout_secs")]
    pub pool_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Pool acquire timeout as a [`Duration`]
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("membank.jsonl")
}

/// Flat-file fallback parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Location of the NDJSON entry file
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
        }
    }
}

fn default_cache_max_size() -> usize {
    128
}

fn default_cache_ttl_seconds() -> u64 {
    60
}

/// Query result cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached query results before LRU eviction
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    /// Seconds a cached result stays fresh
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Fallback
}

fn default_op_timeout_secs() -> u64 {
    30
}

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Active backend selection
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    /// Relational backend parameters, required when `provider = "relational"`
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
    /// Fallback store parameters; also enables degraded mode when the
    /// relational backend is unreachable at startup
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
    /// Query result cache sizing
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-operation deadline in seconds
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            connection: None,
            fallback: None,
            cache: CacheConfig::default(),
            op_timeout_secs: default_op_timeout_secs(),
        }
    }
}

impl StoreConfig {
    /// Load and validate a configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: StoreConfig =
            toml::from_str(&contents).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Convenience constructor for a fallback-only store
    pub fn fallback_at(path: impl Into<PathBuf>) -> Self {
        Self {
            provider: ProviderKind::Fallback,
            fallback: Some(FallbackConfig {
                storage_path: path.into(),
            }),
            ..Self::default()
        }
    }

    /// The fallback parameters, defaulted when the section is absent
    pub fn fallback_or_default(&self) -> FallbackConfig {
        self.fallback.clone().unwrap_or_default()
    }

    /// Per-operation deadline as a [`Duration`]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    /// Check option combinations before opening any backend.
    pub fn validate(&self) -> Result<()> {
        if let ProviderKind::Relational = self.provider {
            let conn = self.connection.as_ref().ok_or_else(|| {
                Error::Configuration(
                    "relational provider requires a [connection] section".to_string(),
                )
            })?;
            if conn.host.trim().is_empty() {
                return Err(Error::Configuration(
                    "connection.host must not be empty".to_string(),
                ));
            }
            if conn.database.trim().is_empty() {
                return Err(Error::Configuration(
                    "connection.database must not be empty".to_string(),
                ));
            }
            if conn.user.trim().is_empty() {
                return Err(Error::Configuration(
                    "connection.user must not be empty".to_string(),
                ));
            }
            if conn.pool_size == 0 {
                return Err(Error::Configuration(
                    "connection.pool_size must be at least 1".to_string(),
                ));
            }
        }
        if self.cache.max_size == 0 {
            return Err(Error::Configuration(
                "cache.max_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
