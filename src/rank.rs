//! Relevance ranking - orders query candidates
//!
//! The combined score blends three signals:
//! - textual match against the query, as reported by the provider
//! - recency, decayed exponentially with a 30-day half-life
//! - success rating, normalized to [0, 1]
//!
//! All inputs are bounded to [0, 1], so the combined score is too.

use crate::entry::MemoryEntry;
use crate::provider::Candidate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Weight of the textual match signal
pub const MATCH_WEIGHT: f64 = 0.6;
/// Weight of the recency signal
pub const RECENCY_WEIGHT: f64 = 0.2;
/// Weight of the rating signal
pub const RATING_WEIGHT: f64 = 0.2;

/// Days for the recency signal to halve
pub const HALF_LIFE_DAYS: f64 = 30.0;

/// Providers fetch this many times the requested limit, giving the
/// ranker slack to drop low scorers without starving the result set.
pub const CANDIDATE_FACTOR: usize = 3;

/// A ranked query result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    /// Combined relevance in [0, 1]
    pub relevance: f64,
}

/// Exponential recency decay in (0, 1].
///
/// An entry created `now` scores 1.0; one created [`HALF_LIFE_DAYS`]
/// ago scores 0.5. Timestamps in the future (clock skew) clamp to 1.0.
pub fn recency_decay(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds() as f64 / 86_400.0;
    if age_days <= 0.0 {
        return 1.0;
    }
    let decay_constant = std::f64::consts::LN_2 / HALF_LIFE_DAYS;
    (-decay_constant * age_days).exp()
}

/// Normalize a 1..=5 rating to [0, 1]
pub fn rating_weight(rating: u8) -> f64 {
    f64::from(rating.saturating_sub(1).min(4)) / 4.0
}

/// Blend the three signals into one combined score
pub fn combine(match_score: f64, recency: f64, rating: f64) -> f64 {
    MATCH_WEIGHT * match_score + RECENCY_WEIGHT * recency + RATING_WEIGHT * rating
}

/// Fraction of distinct query tokens present in `text`, in [0, 1].
///
/// The fallback provider's stand-in for a full-text rank: no stemming,
/// no positional weighting, just case-insensitive token containment.
pub fn token_overlap(query: &str, text: &str) -> f64 {
    let tokens: HashSet<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let text = text.to_lowercase();
    let matched = tokens.iter().filter(|token| text.contains(token.as_str())).count();
    matched as f64 / tokens.len() as f64
}

/// Score, filter, and order candidates.
///
/// Candidates below `min_relevance` are dropped; the rest sort by
/// combined score descending, ties broken by `created_at` descending
/// (newer wins), then id descending; the result is truncated to
/// `limit`.
pub fn rank(
    candidates: Vec<Candidate>,
    min_relevance: f64,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<ScoredEntry> {
    let mut scored: Vec<ScoredEntry> = candidates
        .into_iter()
        .map(|candidate| {
            let relevance = combine(
                candidate.match_score,
                recency_decay(candidate.entry.created_at, now),
                rating_weight(candidate.entry.success_rating),
            );
            ScoredEntry {
                entry: candidate.entry,
                relevance,
            }
        })
        .filter(|scored| scored.relevance >= min_relevance)
        .collect();

    scored.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
            .then_with(|| b.entry.id.cmp(&a.entry.id))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::UNKNOWN_MODEL;

    fn candidate(id: i64, match_score: f64, rating: u8, age_days: i64) -> Candidate {
        Candidate {
            entry: MemoryEntry {
                id,
                agent_name: "helper".to_string(),
                task: format!("task {}", id),
                response: format!("response {}", id),
                success_rating: rating,
                model_used: UNKNOWN_MODEL.to_string(),
                tokens_used: 0,
                created_at: Utc::now() - chrono::Duration::days(age_days),
                metadata: serde_json::json!({}),
                parent_id: None,
            },
            match_score,
        }
    }

    #[test]
    fn test_recency_decay_half_life() {
        let now = Utc::now();
        let decay = recency_decay(now - chrono::Duration::days(30), now);
        assert!((decay - 0.5).abs() < 1e-3, "got {}", decay);
    }

    #[test]
    fn test_recency_decay_clamps_future() {
        let now = Utc::now();
        assert_eq!(recency_decay(now + chrono::Duration::days(2), now), 1.0);
    }

    #[test]
    fn test_rating_weight_range() {
        assert_eq!(rating_weight(1), 0.0);
        assert_eq!(rating_weight(3), 0.5);
        assert_eq!(rating_weight(5), 1.0);
    }

    #[test]
    fn test_combine_is_bounded() {
        assert!((combine(1.0, 1.0, 1.0) - 1.0).abs() < 1e-12);
        assert_eq!(combine(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_token_overlap() {
        assert_eq!(token_overlap("q3 sales", "Analyze Q3 sales data"), 1.0);
        assert_eq!(token_overlap("q3 revenue", "Analyze Q3 sales data"), 0.5);
        assert_eq!(token_overlap("", "anything"), 0.0);
        assert_eq!(token_overlap("missing", "Analyze Q3 sales data"), 0.0);
    }

    #[test]
    fn test_rank_orders_by_relevance() {
        let ranked = rank(
            vec![candidate(1, 0.2, 3, 0), candidate(2, 0.9, 3, 0)],
            0.0,
            10,
            Utc::now(),
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].entry.id, 2);
        assert!(ranked[0].relevance > ranked[1].relevance);
    }

    #[test]
    fn test_rank_drops_below_min_relevance() {
        let ranked = rank(
            vec![candidate(1, 0.0, 1, 365), candidate(2, 1.0, 5, 0)],
            0.5,
            10,
            Utc::now(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].entry.id, 2);
    }

    #[test]
    fn test_rank_truncates_to_limit() {
        let candidates = (1..=8).map(|id| candidate(id, 0.5, 3, 0)).collect();
        let ranked = rank(candidates, 0.0, 3, Utc::now());
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_rank_ties_prefer_newer() {
        // identical match and rating, different ages: the newer entry
        // scores higher through recency alone
        let ranked = rank(
            vec![candidate(1, 0.5, 3, 40), candidate(2, 0.5, 3, 1)],
            0.0,
            10,
            Utc::now(),
        );
        assert_eq!(ranked[0].entry.id, 2);

        // exact relevance ties fall back to created_at descending
        let now = Utc::now();
        let mut a = candidate(1, 0.5, 3, 0);
        let mut b = candidate(2, 0.5, 3, 0);
        a.entry.created_at = now - chrono::Duration::days(10);
        b.entry.created_at = now - chrono::Duration::days(10);
        // same timestamp, so the higher id wins
        let ranked = rank(vec![a, b], 0.0, 10, now);
        assert_eq!(ranked[0].entry.id, 2);
    }
}
