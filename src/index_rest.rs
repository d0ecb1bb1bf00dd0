//! Pinecone-compatible REST vector index client.
//!
//! Each index key maps to a base URL in `[index.hosts]`. Requests use
//! `POST {host}/query` and `POST {host}/vectors/upsert` with an `Api-Key`
//! header read from the environment variable named by `index.api_key_env`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use knowledge_relay_core::index::memory::InMemoryVectorIndex;
use knowledge_relay_core::index::{IndexMatch, IndexQuery, IndexRecord, VectorIndex};
use knowledge_relay_core::models::Metadata;

use crate::config::IndexConfig;

/// Build the vector index named by `config.provider` (`memory` or `rest`).
pub fn create_index(config: &IndexConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(InMemoryVectorIndex::new())),
        "rest" => Ok(Arc::new(RestVectorIndex::new(config)?)),
        other => bail!("Unknown index provider: {}", other),
    }
}

pub struct RestVectorIndex {
    hosts: HashMap<String, String>,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<IndexMatch>,
}

#[derive(Deserialize)]
struct UpsertResponse {
    #[serde(rename = "upsertedCount")]
    upserted_count: Option<usize>,
}

impl RestVectorIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            hosts: config.hosts.clone(),
            api_key,
            client,
        })
    }

    fn host(&self, index: &str) -> Result<&str> {
        self.hosts
            .get(index)
            .map(|h| h.trim_end_matches('/'))
            .ok_or_else(|| anyhow!("no host configured for index '{}'", index))
    }

    async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("vector index request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("vector index error {}: {}", status, body_text);
        }
        Ok(response)
    }
}

/// Translate an equality filter map into the `$eq` operator form.
pub fn to_filter_expr(filter: &Metadata) -> Value {
    let clauses: serde_json::Map<String, Value> = filter
        .iter()
        .map(|(k, v)| (k.clone(), json!({ "$eq": v })))
        .collect();
    Value::Object(clauses)
}

#[async_trait]
impl VectorIndex for RestVectorIndex {
    async fn upsert(
        &self,
        index: &str,
        namespace: &str,
        records: Vec<IndexRecord>,
    ) -> Result<usize> {
        let n = records.len();
        let vectors: Vec<Value> = records
            .into_iter()
            .map(|r| json!({ "id": r.id, "values": r.vector, "metadata": r.metadata }))
            .collect();
        let body = json!({ "vectors": vectors, "namespace": namespace });

        let url = format!("{}/vectors/upsert", self.host(index)?);
        let parsed: UpsertResponse = self
            .post(url, &body)
            .await?
            .json()
            .await
            .context("invalid upsert response")?;
        Ok(parsed.upserted_count.unwrap_or(n))
    }

    async fn query(
        &self,
        index: &str,
        namespace: &str,
        query: &IndexQuery,
    ) -> Result<Vec<IndexMatch>> {
        let mut body = json!({
            "namespace": namespace,
            "vector": query.vector,
            "topK": query.top_k,
            "includeMetadata": true,
        });
        if !query.filter.is_empty() {
            body["filter"] = to_filter_expr(&query.filter);
        }

        let url = format!("{}/query", self.host(index)?);
        let parsed: QueryResponse = self
            .post(url, &body)
            .await?
            .json()
            .await
            .context("invalid query response")?;
        Ok(parsed.matches)
    }
}
