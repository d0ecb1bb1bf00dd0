//! In-memory [`VectorIndex`] implementation for tests and single-node use.
//!
//! Records are kept per `(index, namespace)` behind a `parking_lot::RwLock`.
//! Queries are brute-force cosine similarity over the namespace.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{matches_filter, IndexMatch, IndexQuery, IndexRecord, VectorIndex};
use crate::embedding::cosine_similarity;

type Namespace = HashMap<String, IndexRecord>;

/// In-memory vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    namespaces: RwLock<HashMap<(String, String), Namespace>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored under `(index, namespace)`.
    pub fn len(&self, index: &str, namespace: &str) -> usize {
        self.namespaces
            .read()
            .get(&(index.to_string(), namespace.to_string()))
            .map(|ns| ns.len())
            .unwrap_or(0)
    }

    /// Fetch a stored record by id.
    pub fn get(&self, index: &str, namespace: &str, id: &str) -> Option<IndexRecord> {
        self.namespaces
            .read()
            .get(&(index.to_string(), namespace.to_string()))
            .and_then(|ns| ns.get(id).cloned())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        index: &str,
        namespace: &str,
        records: Vec<IndexRecord>,
    ) -> Result<usize> {
        let n = records.len();
        let mut guard = self.namespaces.write();
        let ns = guard
            .entry((index.to_string(), namespace.to_string()))
            .or_default();
        for record in records {
            ns.insert(record.id.clone(), record);
        }
        Ok(n)
    }

    async fn query(
        &self,
        index: &str,
        namespace: &str,
        query: &IndexQuery,
    ) -> Result<Vec<IndexMatch>> {
        let guard = self.namespaces.read();
        let Some(ns) = guard.get(&(index.to_string(), namespace.to_string())) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<IndexMatch> = ns
            .values()
            .filter(|r| matches_filter(&r.metadata, &query.filter))
            .map(|r| IndexMatch {
                id: r.id.clone(),
                score: cosine_similarity(&query.vector, &r.vector) as f64,
                metadata: r.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(query.top_k);
        Ok(matches)
    }
}
