//! Scoring and ranking of vector index matches.
//!
//! The retrieval engine hands every partition's raw matches to this module
//! and gets back one list ordered by combined score.
//!
//! # Scoring
//!
//! 1. `freshness = clamp(1 - age_hours / ttl_hours, 0, 1)`, or `0` when the
//!    partition's timestamp field is missing or unparsable.
//! 2. `combined = w_sim × similarity + w_fresh × freshness`.
//! 3. Sort all matches by `combined` (desc), then document id (asc) so
//!    ties are stable across runs.
//! 4. Drop everything below `score_threshold`.
//!
//! The weights and the threshold are policy, not load-bearing constants;
//! [`ScoringPolicy::default`] carries the reference values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::index::IndexMatch;
use crate::models::ScoredChunk;
use crate::partition::{freshness_status, PartitionDef};

/// Tunable ranking policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub similarity_weight: f64,
    pub freshness_weight: f64,
    pub score_threshold: f64,
    pub default_top_k: usize,
    pub max_top_k: usize,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            similarity_weight: 0.8,
            freshness_weight: 0.2,
            score_threshold: 0.65,
            default_top_k: 5,
            max_top_k: 20,
        }
    }
}

impl ScoringPolicy {
    /// Clamp a requested result cap into `[1, max_top_k]`.
    pub fn clamp_top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_top_k)
            .clamp(1, self.max_top_k.max(1))
    }

    pub fn combine(&self, similarity: f64, freshness: f64) -> f64 {
        self.similarity_weight * similarity + self.freshness_weight * freshness
    }

    /// Score one index match from `partition`.
    pub fn score(&self, partition: &PartitionDef, m: IndexMatch, now: DateTime<Utc>) -> ScoredChunk {
        let age = partition
            .timestamp(&m.metadata)
            .and_then(parse_timestamp)
            .map(|ts| age_hours(ts, now));
        let freshness = age
            .map(|a| freshness_score(a, partition.ttl_hours))
            .unwrap_or(0.0);
        let text = m
            .metadata
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        ScoredChunk {
            document_id: m.id,
            partition: partition.id.clone(),
            text,
            similarity: m.score,
            freshness,
            freshness_status: freshness_status(age, partition.ttl_hours),
            combined: self.combine(m.score, freshness),
            metadata: m.metadata,
        }
    }

    /// Sort by combined score (desc) and split off everything below the
    /// threshold. Returns the passing chunks, still sorted.
    pub fn rank(&self, mut chunks: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        sort_by_combined(&mut chunks);
        let cut = chunks
            .iter()
            .position(|c| c.combined < self.score_threshold)
            .unwrap_or(chunks.len());
        chunks.truncate(cut);
        chunks
    }
}

/// Sort descending by combined score, ties broken by document id.
pub fn sort_by_combined(chunks: &mut [ScoredChunk]) {
    chunks.sort_by(|a, b| {
        b.combined
            .total_cmp(&a.combined)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
}

/// Linear freshness decay, clamped to `[0.0, 1.0]`.
pub fn freshness_score(age_hours: f64, ttl_hours: f64) -> f64 {
    if ttl_hours <= 0.0 || age_hours.is_nan() {
        return 0.0;
    }
    (1.0 - age_hours / ttl_hours).clamp(0.0, 1.0)
}

/// Hours between `ts` and `now` (negative for future timestamps).
pub fn age_hours(ts: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - ts).num_milliseconds() as f64 / 3_600_000.0
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}
