//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only way the retrieval engine talks to
//! a vector store. Records live in `(index, namespace)` pairs; a partition
//! maps to its backing index key and uses its own id as the namespace.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::Metadata;

/// A vector plus metadata to upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

/// A similarity query against one namespace.
///
/// `filter` is a conjunction of equality constraints on metadata fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexQuery {
    pub vector: Vec<f32>,
    pub top_k: usize,
    pub filter: Metadata,
}

/// One match returned by a query, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMatch {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Per-namespace upsert and similarity query with metadata filtering.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id. Returns the number written.
    async fn upsert(&self, index: &str, namespace: &str, records: Vec<IndexRecord>)
        -> Result<usize>;

    /// Return at most `query.top_k` matches, highest score first.
    async fn query(&self, index: &str, namespace: &str, query: &IndexQuery)
        -> Result<Vec<IndexMatch>>;
}

/// True when every filter entry equals the same key in `metadata`.
pub fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(k, want)| metadata.get(k).is_some_and(|have| have == want))
}
