//! Rolling analytics - per-model counters and derived statistics
//!
//! The [`Aggregator`] folds every inserted entry into rolling counters
//! and derives a [`StatsSnapshot`] on demand. Its state must always
//! equal what a full backend scan would compute, so the store seeds it
//! at startup and re-seeds it after any delete instead of trying to
//! decrement counters.

use crate::entry::{MemoryEntry, UNKNOWN_MODEL};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Per-model aggregate exposed in [`StatsSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub entries: u64,
    pub avg_rating: f64,
    pub tokens_used: u64,
}

/// Derived summary statistics; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_entries: u64,
    /// Mean success rating over all entries, 0.0 when empty
    pub avg_success_rating: f64,
    pub total_tokens_used: u64,
    /// Model with the most entries; the `"unknown"` sentinel never
    /// wins, and ties go to the model seen first
    pub top_model: Option<String>,
    /// Named models in first-seen order (the sentinel is omitted)
    pub per_model: Vec<ModelStats>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Condensed model analytics view
    pub fn model_performance(&self) -> ModelPerformance {
        ModelPerformance {
            total_models: self.per_model.len(),
            top_model: self.top_model.clone(),
            avg_rating: self.avg_success_rating,
            total_usage: self.total_entries,
        }
    }
}

/// Condensed per-model analytics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPerformance {
    pub total_models: usize,
    pub top_model: Option<String>,
    pub avg_rating: f64,
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default)]
struct ModelCounter {
    entries: u64,
    rating_sum: u64,
    tokens_used: u64,
    first_seen: u64,
}

/// Rolling counters over the live entry corpus.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    total_entries: u64,
    rating_sum: u64,
    token_sum: u64,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    models: HashMap<String, ModelCounter>,
    next_seq: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute counters from a full entry scan.
    ///
    /// Iteration order fixes the first-seen ordering, so callers pass
    /// entries in insertion (id) order.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a MemoryEntry>) -> Self {
        let mut agg = Self::new();
        for entry in entries {
            agg.record(entry);
        }
        agg
    }

    /// Fold one inserted entry into the rolling counters
    pub fn record(&mut self, entry: &MemoryEntry) {
        self.total_entries += 1;
        self.rating_sum += u64::from(entry.success_rating);
        self.token_sum += u64::from(entry.tokens_used);
        self.oldest = Some(match self.oldest {
            Some(t) => t.min(entry.created_at),
            None => entry.created_at,
        });
        self.newest = Some(match self.newest {
            Some(t) => t.max(entry.created_at),
            None => entry.created_at,
        });

        let seq = self.next_seq;
        let counter = self
            .models
            .entry(entry.model_used.clone())
            .or_insert_with(|| ModelCounter {
                first_seen: seq,
                ..ModelCounter::default()
            });
        counter.entries += 1;
        counter.rating_sum += u64::from(entry.success_rating);
        counter.tokens_used += u64::from(entry.tokens_used);
        self.next_seq += 1;
    }

    /// Derive the public statistics view
    pub fn snapshot(&self) -> StatsSnapshot {
        let avg_success_rating = if self.total_entries == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.total_entries as f64
        };

        let mut named: Vec<(&String, &ModelCounter)> = self
            .models
            .iter()
            .filter(|(name, _)| name.as_str() != UNKNOWN_MODEL)
            .collect();
        named.sort_by_key(|(_, counter)| counter.first_seen);

        let per_model = named
            .iter()
            .map(|(name, counter)| ModelStats {
                model: (*name).clone(),
                entries: counter.entries,
                avg_rating: counter.rating_sum as f64 / counter.entries as f64,
                tokens_used: counter.tokens_used,
            })
            .collect();

        // strict greater keeps the earlier-seen model on ties
        let mut top: Option<(&String, &ModelCounter)> = None;
        for (name, counter) in named.iter().copied() {
            match top {
                Some((_, best)) if counter.entries <= best.entries => {}
                _ => top = Some((name, counter)),
            }
        }

        StatsSnapshot {
            total_entries: self.total_entries,
            avg_success_rating,
            total_tokens_used: self.token_sum,
            top_model: top.map(|(name, _)| name.clone()),
            per_model,
            oldest: self.oldest,
            newest: self.newest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, model: &str, rating: u8, tokens: u32, age_days: i64) -> MemoryEntry {
        MemoryEntry {
            id,
            agent_name: "helper".to_string(),
            task: format!("task {}", id),
            response: format!("response {}", id),
            success_rating: rating,
            model_used: model.to_string(),
            tokens_used: tokens,
            created_at: Utc::now() - chrono::Duration::days(age_days),
            metadata: serde_json::json!({}),
            parent_id: None,
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = Aggregator::new().snapshot();
        assert_eq!(snapshot.total_entries, 0);
        assert_eq!(snapshot.avg_success_rating, 0.0);
        assert_eq!(snapshot.total_tokens_used, 0);
        assert!(snapshot.top_model.is_none());
        assert!(snapshot.per_model.is_empty());
        assert!(snapshot.oldest.is_none());
    }

    #[test]
    fn test_snapshot_counts() {
        let entries = vec![
            entry(1, "gpt-4-turbo", 5, 450, 2),
            entry(2, "claude-3", 3, 100, 1),
            entry(3, "gpt-4-turbo", 4, 50, 0),
        ];
        let snapshot = Aggregator::from_entries(&entries).snapshot();

        assert_eq!(snapshot.total_entries, 3);
        assert!((snapshot.avg_success_rating - 4.0).abs() < 1e-12);
        assert_eq!(snapshot.total_tokens_used, 600);
        assert_eq!(snapshot.top_model.as_deref(), Some("gpt-4-turbo"));
        assert_eq!(snapshot.per_model.len(), 2);
        assert_eq!(snapshot.per_model[0].model, "gpt-4-turbo");
        assert_eq!(snapshot.per_model[0].entries, 2);
        assert!((snapshot.per_model[0].avg_rating - 4.5).abs() < 1e-12);
        assert!(snapshot.oldest.unwrap() < snapshot.newest.unwrap());
    }

    #[test]
    fn test_top_model_excludes_sentinel() {
        let entries = vec![
            entry(1, UNKNOWN_MODEL, 5, 0, 0),
            entry(2, UNKNOWN_MODEL, 5, 0, 0),
            entry(3, "claude-3", 2, 0, 0),
        ];
        let snapshot = Aggregator::from_entries(&entries).snapshot();
        assert_eq!(snapshot.top_model.as_deref(), Some("claude-3"));

        let all_unknown = vec![entry(1, UNKNOWN_MODEL, 5, 0, 0)];
        let snapshot = Aggregator::from_entries(&all_unknown).snapshot();
        assert!(snapshot.top_model.is_none());
        assert!(snapshot.per_model.is_empty());
        assert_eq!(snapshot.total_entries, 1);
    }

    #[test]
    fn test_top_model_tie_goes_to_first_seen() {
        let entries = vec![
            entry(1, "alpha", 3, 0, 0),
            entry(2, "beta", 3, 0, 0),
            entry(3, "alpha", 3, 0, 0),
            entry(4, "beta", 3, 0, 0),
        ];
        let snapshot = Aggregator::from_entries(&entries).snapshot();
        assert_eq!(snapshot.top_model.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let entries = vec![
            entry(1, "gpt-4-turbo", 5, 450, 3),
            entry(2, UNKNOWN_MODEL, 1, 0, 2),
            entry(3, "claude-3", 4, 220, 1),
            entry(4, "gpt-4-turbo", 2, 90, 0),
        ];

        let mut rolling = Aggregator::new();
        for e in &entries {
            rolling.record(e);
        }
        let recomputed = Aggregator::from_entries(&entries);

        assert_eq!(rolling.snapshot(), recomputed.snapshot());
    }

    #[test]
    fn test_model_performance_view() {
        let entries = vec![
            entry(1, "gpt-4-turbo", 5, 450, 0),
            entry(2, "claude-3", 3, 100, 0),
        ];
        let perf = Aggregator::from_entries(&entries).snapshot().model_performance();
        assert_eq!(perf.total_models, 2);
        assert_eq!(perf.top_model.as_deref(), Some("gpt-4-turbo"));
        assert_eq!(perf.total_usage, 2);
        assert!((perf.avg_rating - 4.0).abs() < 1e-12);
    }
}
