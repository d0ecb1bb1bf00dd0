//! Embedding provider implementations.
//!
//! - **[`DisabledEmbedder`]**: fails every call; used when
//!   `embedding.provider = "disabled"`. Retrieval then degrades to an empty
//!   result tagged `embedding_failed`.
//! - **[`HttpEmbedder`]**: OpenAI or Voyage embeddings API, batched, with
//!   retry and backoff.
//! - **[`HashEmbedder`]**: deterministic offline embedder from the core
//!   crate.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use knowledge_relay_core::embedding::{cosine_similarity, embed_one, Embedder, HashEmbedder};

use crate::config::EmbeddingConfig;

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" => Ok(Arc::new(HttpEmbedder::new(ApiFlavor::OpenAi, config)?)),
        "voyage" => Ok(Arc::new(HttpEmbedder::new(ApiFlavor::Voyage, config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// An embedder that always fails.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ HTTP (OpenAI / Voyage) ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    OpenAi,
    Voyage,
}

impl ApiFlavor {
    fn default_url(self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "https://api.openai.com/v1/embeddings",
            ApiFlavor::Voyage => "https://api.voyageai.com/v1/embeddings",
        }
    }

    fn default_key_env(self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "OPENAI_API_KEY",
            ApiFlavor::Voyage => "VOYAGE_API_KEY",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "OpenAI",
            ApiFlavor::Voyage => "Voyage",
        }
    }
}

/// Embeddings over the `POST {model, input} → data[].embedding` API shape
/// shared by OpenAI and Voyage.
pub struct HttpEmbedder {
    flavor: ApiFlavor,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set, or the API key
    /// environment variable is missing.
    pub fn new(flavor: ApiFlavor, config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", flavor.label()))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", flavor.label()))?;
        let key_env = config
            .api_key_env
            .as_deref()
            .unwrap_or(flavor.default_key_env());
        let api_key = std::env::var(key_env)
            .map_err(|_| anyhow!("{} environment variable not set", key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            flavor,
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| flavor.default_url().to_string()),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let label = self.flavor.label();

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .with_context(|| format!("{} embeddings response was not JSON", label))?;
                        let vectors = parse_embeddings_response(&json)?;
                        if vectors.len() != texts.len() {
                            bail!(
                                "{} returned {} embeddings for {} inputs",
                                label,
                                vectors.len(),
                                texts.len()
                            );
                        }
                        return Ok(vectors);
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Embedding failed after retries")))
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid embeddings response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
