//! Retrieval engine and ingestion.
//!
//! [`Retriever::retrieve`] turns a query into a token-budgeted context block:
//!
//! 1. Clamp `top_k` and the token budget.
//! 2. Filter requested partitions by role and identity. Nothing left →
//!    empty result tagged `no_accessible_partitions`.
//! 3. Expand trucking shorthand and embed the query under a deadline.
//!    Failure → `embedding_failed`.
//! 4. Query every permitted partition concurrently, each under its own
//!    deadline. A failed partition contributes no matches.
//! 5. Score, merge, sort, and threshold. Nothing left →
//!    `no_chunks_above_threshold`.
//! 6. Assemble the context block within the budget.
//!
//! Only request validation produces an `Err`; every degraded path is an
//! `Ok` result with a reason code.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

use knowledge_relay_core::budget::assemble;
use knowledge_relay_core::embedding::{embed_one, expand_abbreviations, Embedder};
use knowledge_relay_core::index::{IndexMatch, IndexQuery, IndexRecord, VectorIndex};
use knowledge_relay_core::models::{Metadata, NoContextReason, ScoredChunk};
use knowledge_relay_core::partition::{DenyReason, PartitionDef, PartitionRegistry};
use knowledge_relay_core::privacy::{scrub_pii, validate_chunk_text};
use knowledge_relay_core::ranking::ScoringPolicy;

use crate::config::RetrievalConfig;
use crate::error::RelayError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub role: String,
    /// Partitions to search. Empty means the role's defaults.
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Equality filters keyed by partition id.
    #[serde(default)]
    pub filters: HashMap<String, Metadata>,
    #[serde(default)]
    pub budget_tokens: Option<usize>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeniedPartition {
    pub partition: String,
    pub reason: DenyReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub context_block: String,
    /// Chunks included in the block, in inclusion order.
    pub chunks: Vec<ScoredChunk>,
    pub total_considered: usize,
    pub passed_threshold: usize,
    pub tokens_assembled: usize,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_context_reason: Option<NoContextReason>,
    /// Partitions actually queried.
    pub partitions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied: Vec<DeniedPartition>,
}

impl RetrievalResult {
    fn empty(reason: NoContextReason, started: Instant) -> Self {
        Self {
            context_block: String::new(),
            chunks: Vec::new(),
            total_considered: 0,
            passed_threshold: 0,
            tokens_assembled: 0,
            latency_ms: started.elapsed().as_millis() as u64,
            no_context_reason: Some(reason),
            partitions: Vec::new(),
            denied: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    pub partition: String,
    pub document_id: String,
    pub text: String,
    pub role: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub source_updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ingested,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub status: IngestStatus,
    pub document_id: String,
    pub partition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestOutcome {
    fn failed(req: &IngestRequest, error: impl Into<String>) -> Self {
        let error = error.into();
        warn!(partition = %req.partition, document_id = %req.document_id, error = %error, "ingest failed");
        Self {
            status: IngestStatus::Error,
            document_id: req.document_id.clone(),
            partition: req.partition.clone(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
struct Limits {
    default_budget: usize,
    max_budget: usize,
    max_ingest_chars: usize,
    embed_timeout: Duration,
    index_timeout: Duration,
}

pub struct Retriever {
    registry: Arc<PartitionRegistry>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    policy: ScoringPolicy,
    limits: Limits,
}

impl Retriever {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            registry,
            embedder,
            index,
            policy: config.policy(),
            limits: Limits {
                default_budget: config.default_budget_tokens,
                max_budget: config.max_budget_tokens,
                max_ingest_chars: config.max_ingest_chars,
                embed_timeout: Duration::from_millis(config.embed_timeout_ms),
                index_timeout: Duration::from_millis(config.index_timeout_ms),
            },
        }
    }

    pub async fn retrieve(&self, req: &RetrievalRequest) -> Result<RetrievalResult, RelayError> {
        let started = Instant::now();

        let query = req.query.trim();
        if query.is_empty() {
            return Err(RelayError::validation("query must not be empty"));
        }
        let role = req.role.trim();
        if role.is_empty() {
            return Err(RelayError::validation("role must not be empty"));
        }

        let requested: Vec<String> = if req.partitions.is_empty() {
            self.registry.default_partitions(role).to_vec()
        } else {
            req.partitions.clone()
        };
        if let Some(stray) = req.filters.keys().find(|k| !requested.contains(k)) {
            return Err(RelayError::validation(format!(
                "filters name partition '{}' which is not being searched",
                stray
            )));
        }

        let top_k = self.policy.clamp_top_k(req.top_k);
        let budget = req
            .budget_tokens
            .unwrap_or(self.limits.default_budget)
            .clamp(1, self.limits.max_budget);

        let decision = self
            .registry
            .accessible(role, &requested, req.user_id.as_deref());
        let denied: Vec<DeniedPartition> = decision
            .denied
            .into_iter()
            .map(|(partition, reason)| {
                warn!(partition = %partition, role, ?reason, "partition excluded from retrieval");
                DeniedPartition { partition, reason }
            })
            .collect();

        if decision.granted.is_empty() {
            let mut result =
                RetrievalResult::empty(NoContextReason::NoAccessiblePartitions, started);
            result.denied = denied;
            return Ok(result);
        }

        let vector = match timeout(
            self.limits.embed_timeout,
            embed_one(self.embedder.as_ref(), &expand_abbreviations(query)),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed");
                let mut result = RetrievalResult::empty(NoContextReason::EmbeddingFailed, started);
                result.denied = denied;
                return Ok(result);
            }
            Err(_) => {
                warn!(timeout_ms = self.limits.embed_timeout.as_millis() as u64, "query embedding timed out");
                let mut result = RetrievalResult::empty(NoContextReason::EmbeddingFailed, started);
                result.denied = denied;
                return Ok(result);
            }
        };

        let queries = decision.granted.iter().map(|partition| {
            let filter = self.partition_filter(partition, req);
            let q = IndexQuery {
                vector: vector.clone(),
                top_k,
                filter,
            };
            async move {
                let matches = self.query_partition(partition, &q).await;
                (*partition, matches)
            }
        });
        let settled = join_all(queries).await;

        let now = Utc::now();
        let scored: Vec<ScoredChunk> = settled
            .into_iter()
            .flat_map(|(partition, matches)| {
                matches
                    .into_iter()
                    .map(move |m| (partition, m))
            })
            .map(|(partition, m)| self.policy.score(partition, m, now))
            .collect();
        let total_considered = scored.len();

        let ranked = self.policy.rank(scored);
        let passed_threshold = ranked.len();
        let queried: Vec<String> = decision.granted.iter().map(|p| p.id.clone()).collect();

        let (assembled, reason) = if ranked.is_empty() {
            (Default::default(), Some(NoContextReason::NoChunksAboveThreshold))
        } else {
            let assembled = assemble(&ranked, budget, &self.registry);
            let reason = assembled
                .is_empty()
                .then_some(NoContextReason::BudgetExhausted);
            (assembled, reason)
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            role,
            partitions = queried.len(),
            total_considered,
            passed_threshold,
            included = assembled.included.len(),
            tokens = assembled.total_tokens,
            latency_ms,
            "retrieval complete"
        );

        Ok(RetrievalResult {
            context_block: assembled.block,
            chunks: assembled.included,
            total_considered,
            passed_threshold,
            tokens_assembled: assembled.total_tokens,
            latency_ms,
            no_context_reason: reason,
            partitions: queried,
            denied,
        })
    }

    /// Caller filters for `partition`, with the identity constraint forced
    /// on top when the partition declares one.
    fn partition_filter(&self, partition: &PartitionDef, req: &RetrievalRequest) -> Metadata {
        let mut filter = req.filters.get(&partition.id).cloned().unwrap_or_default();
        if let (Some(field), Some(user)) = (&partition.identity_field, &req.user_id) {
            filter.insert(field.clone(), serde_json::Value::String(user.trim().to_string()));
        }
        filter
    }

    async fn query_partition(&self, partition: &PartitionDef, q: &IndexQuery) -> Vec<IndexMatch> {
        match timeout(
            self.limits.index_timeout,
            self.index.query(&partition.index, &partition.id, q),
        )
        .await
        {
            Ok(Ok(matches)) => matches,
            Ok(Err(e)) => {
                warn!(partition = %partition.id, error = %e, "partition query failed");
                Vec::new()
            }
            Err(_) => {
                warn!(partition = %partition.id, "partition query timed out");
                Vec::new()
            }
        }
    }

    /// Scrub, embed, and upsert one document into a partition. The stored
    /// text keeps its ingested wording; only the embedded copy has
    /// shorthand expanded.
    ///
    /// Missing fields and access violations are request errors; everything
    /// else is reported through [`IngestOutcome`].
    pub async fn ingest(&self, req: &IngestRequest) -> Result<IngestOutcome, RelayError> {
        if req.partition.trim().is_empty() {
            return Err(RelayError::validation("partition must not be empty"));
        }
        if req.document_id.trim().is_empty() {
            return Err(RelayError::validation("document_id must not be empty"));
        }
        if req.role.trim().is_empty() {
            return Err(RelayError::validation("role must not be empty"));
        }

        let partition = self
            .registry
            .get(&req.partition)
            .ok_or_else(|| RelayError::validation(format!("unknown partition '{}'", req.partition)))?;
        if !partition.allows(req.role.trim()) {
            return Err(RelayError::access(format!(
                "role '{}' may not write to partition '{}'",
                req.role, req.partition
            )));
        }

        let text = match validate_chunk_text(&req.text, self.limits.max_ingest_chars) {
            Ok(t) => scrub_pii(t),
            Err(e) => return Ok(IngestOutcome::failed(req, e.to_string())),
        };

        if let Some(field) = &partition.identity_field {
            let present = req
                .metadata
                .get(field)
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.trim().is_empty());
            if !present {
                return Ok(IngestOutcome::failed(
                    req,
                    format!("metadata.{} is required for partition '{}'", field, partition.id),
                ));
            }
        }

        let vector = match timeout(
            self.limits.embed_timeout,
            embed_one(self.embedder.as_ref(), &expand_abbreviations(&text)),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Ok(IngestOutcome::failed(req, format!("embedding failed: {}", e))),
            Err(_) => return Ok(IngestOutcome::failed(req, "embedding timed out")),
        };

        let metadata = self.ingest_metadata(partition, req, &text);
        let record = IndexRecord {
            id: req.document_id.clone(),
            vector,
            metadata,
        };

        match timeout(
            self.limits.index_timeout,
            self.index
                .upsert(&partition.index, &partition.id, vec![record]),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!(partition = %partition.id, document_id = %req.document_id, "document ingested");
                Ok(IngestOutcome {
                    status: IngestStatus::Ingested,
                    document_id: req.document_id.clone(),
                    partition: partition.id.clone(),
                    error: None,
                })
            }
            Ok(Err(e)) => Ok(IngestOutcome::failed(req, format!("upsert failed: {}", e))),
            Err(_) => Ok(IngestOutcome::failed(req, "upsert timed out")),
        }
    }

    fn ingest_metadata(&self, partition: &PartitionDef, req: &IngestRequest, text: &str) -> Metadata {
        use serde_json::Value;

        let ingested_at = Utc::now().to_rfc3339();
        let mut metadata = req.metadata.clone();
        metadata.insert("text".into(), Value::String(text.to_string()));
        metadata.insert("partition".into(), Value::String(partition.id.clone()));
        metadata.insert("ingested_at".into(), Value::String(ingested_at.clone()));
        metadata.insert(
            "content_hash".into(),
            Value::String(hex::encode(Sha256::digest(text.as_bytes()))),
        );
        if let Some(src) = &req.source_updated_at {
            metadata.insert("source_updated_at".into(), Value::String(src.clone()));
        }
        if let Some(field) = &partition.timestamp_field {
            if !metadata.contains_key(field) {
                let ts = req.source_updated_at.clone().unwrap_or(ingested_at);
                metadata.insert(field.clone(), Value::String(ts));
            }
        }
        metadata
    }
}
