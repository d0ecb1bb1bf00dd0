//! Data types shared by the ranking, budgeting, and retrieval layers.
//!
//! Everything here is ephemeral: created fresh for one request and never
//! persisted by this crate.

use serde::{Deserialize, Serialize};

use crate::partition::FreshnessStatus;

/// Free-form metadata attached to an indexed record.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A candidate chunk after scoring.
///
/// Built from one vector index match. `combined` is the value every
/// ranking and threshold decision is made on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// Source document id (the index record id).
    pub document_id: String,
    /// Partition the match came from.
    pub partition: String,
    /// Raw chunk text, as stored in the record's `text` metadata field.
    pub text: String,
    /// Similarity reported by the vector index.
    pub similarity: f64,
    /// Linear freshness decay in `[0.0, 1.0]`.
    pub freshness: f64,
    pub freshness_status: FreshnessStatus,
    /// Weighted blend of `similarity` and `freshness`.
    pub combined: f64,
    /// Full record metadata.
    pub metadata: Metadata,
}

/// Why a retrieval produced no context block.
///
/// "Nothing relevant" and "the subsystem failed" share the empty result
/// shape and differ only by this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoContextReason {
    NoAccessiblePartitions,
    EmbeddingFailed,
    NoChunksAboveThreshold,
    BudgetExhausted,
}

impl NoContextReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoContextReason::NoAccessiblePartitions => "no_accessible_partitions",
            NoContextReason::EmbeddingFailed => "embedding_failed",
            NoContextReason::NoChunksAboveThreshold => "no_chunks_above_threshold",
            NoContextReason::BudgetExhausted => "budget_exhausted",
        }
    }
}
