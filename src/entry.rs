//! Memory entry types - the core data model
//!
//! Every recorded interaction becomes a [`MemoryEntry`]:
//! - `MemoryEntry`: an immutable persisted interaction record
//! - `NewEntry`: caller-supplied input, validated before any I/O
//! - `DeleteFilter`: a typed conjunction of delete conditions
//!
//! Entries are never partially updated. A correction is a new entry,
//! usually linked to the original via `parent_id`.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel model name recorded when the caller does not name one.
pub const UNKNOWN_MODEL: &str = "unknown";

/// Lowest accepted success rating.
pub const RATING_MIN: u8 = 1;
/// Highest accepted success rating.
pub const RATING_MAX: u8 = 5;

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

/// A persisted interaction record.
///
/// Immutable once created: the only way an entry changes is by being
/// removed through cleanup or a filtered delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Backend-assigned identifier, monotonically increasing per backend
    pub id: i64,
    /// Name of the agent that produced the interaction
    pub agent_name: String,
    /// The task the agent was given
    pub task: String,
    /// The agent's response
    pub response: String,
    /// Self-reported outcome quality, 1 (failure) to 5 (success)
    pub success_rating: u8,
    /// Model that produced the response, `"unknown"` when not recorded
    pub model_used: String,
    /// Token count consumed by the interaction
    pub tokens_used: u32,
    /// Insertion timestamp, assigned by the backend
    pub created_at: DateTime<Utc>,
    /// Opaque caller-owned annotations
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
    /// Weak reference to a prior entry; dangling links are legal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
}

/// Caller-supplied input for a new entry.
///
/// The backend assigns `id` and `created_at`; callers can never preset
/// either. Optional fields use chainable setters.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub agent_name: String,
    pub task: String,
    pub response: String,
    pub success_rating: u8,
    pub model_used: Option<String>,
    pub tokens_used: u32,
    pub metadata: Option<serde_json::Value>,
    pub parent_id: Option<i64>,
}

impl NewEntry {
    /// Create a new entry input with the required fields
    pub fn new(
        agent_name: impl Into<String>,
        task: impl Into<String>,
        response: impl Into<String>,
        success_rating: u8,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            task: task.into(),
            response: response.into(),
            success_rating,
            model_used: None,
            tokens_used: 0,
            metadata: None,
            parent_id: None,
        }
    }

    /// Set the model that produced the response
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_used = Some(model.into());
        self
    }

    /// Set the token count consumed
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Attach opaque metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Link this entry to a prior one
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// The model name to persist, falling back to the sentinel
    pub fn model_or_default(&self) -> &str {
        self.model_used.as_deref().unwrap_or(UNKNOWN_MODEL)
    }

    /// The metadata to persist, falling back to an empty object
    pub fn metadata_or_default(&self) -> serde_json::Value {
        self.metadata.clone().unwrap_or_else(default_metadata)
    }

    /// Check the entry invariants before any storage I/O.
    ///
    /// Fails with [`Error::Validation`] and no side effect on the first
    /// violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.trim().is_empty() {
            return Err(Error::Validation("agent_name must not be empty".to_string()));
        }
        if self.task.trim().is_empty() {
            return Err(Error::Validation("task must not be empty".to_string()));
        }
        if self.response.trim().is_empty() {
            return Err(Error::Validation("response must not be empty".to_string()));
        }
        if !(RATING_MIN..=RATING_MAX).contains(&self.success_rating) {
            return Err(Error::Validation(format!(
                "success_rating must be between {} and {}, got {}",
                RATING_MIN, RATING_MAX, self.success_rating
            )));
        }
        Ok(())
    }
}

/// A typed conjunction of delete conditions.
///
/// Every set condition must hold for an entry to match (AND semantics).
/// Providers treat an empty filter as matching nothing, and the store
/// rejects it outright.
#[derive(Debug, Clone, Default)]
pub struct DeleteFilter {
    /// Match entries strictly older than this many days
    pub older_than_days: Option<u32>,
    /// Match entries with a rating strictly below this value
    pub rating_below: Option<u8>,
    /// Match entries recorded by this agent
    pub agent_name: Option<String>,
}

impl DeleteFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to entries older than `days` days
    pub fn older_than_days(mut self, days: u32) -> Self {
        self.older_than_days = Some(days);
        self
    }

    /// Restrict to entries rated below `rating`
    pub fn rating_below(mut self, rating: u8) -> Self {
        self.rating_below = Some(rating);
        self
    }

    /// Restrict to entries recorded by `agent`
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    /// True when no condition is set
    pub fn is_empty(&self) -> bool {
        self.older_than_days.is_none() && self.rating_below.is_none() && self.agent_name.is_none()
    }

    /// Evaluate the conjunction against one entry at time `now`
    pub fn matches(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        if let Some(days) = self.older_than_days {
            if now - entry.created_at <= chrono::Duration::days(days as i64) {
                return false;
            }
        }
        if let Some(rating) = self.rating_below {
            if entry.success_rating >= rating {
                return false;
            }
        }
        if let Some(agent) = &self.agent_name {
            if entry.agent_name != *agent {
                return false;
            }
        }
        true
    }
}
