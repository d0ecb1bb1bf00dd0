//! Shared fakes for integration tests.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use knowledge_relay::config::Config;
use knowledge_relay::provider::{
    DeltaStream, GenerationProvider, GenerationRequest, ProviderError, StepOutput, StepResult,
    StopReason, StreamDelta, Usage,
};
use knowledge_relay::research::{LookupSource, Subject};
use knowledge_relay::server::Services;
use knowledge_relay::session::memory::InMemorySessionStore;
use knowledge_relay_core::embedding::Embedder;
use knowledge_relay_core::index::memory::InMemoryVectorIndex;
use knowledge_relay_core::index::{IndexMatch, IndexQuery, IndexRecord, VectorIndex};
use knowledge_relay_core::models::Metadata;
use knowledge_relay_core::partition::PartitionRegistry;

// ============ Generation ============

pub fn text_step(text: &str) -> StepResult {
    StepResult {
        output: StepOutput::Text {
            text: text.to_string(),
        },
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 12,
            output_tokens: 4,
        },
        run_id: "run-test".to_string(),
        latency_ms: 1,
    }
}

/// Provider that replays scripted buffered steps and a fixed delta stream,
/// recording every request it receives.
#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Result<StepResult, ProviderError>>>,
    deltas: Vec<Result<StreamDelta, ProviderError>>,
    delay: Duration,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: &str) -> Self {
        self.steps.lock().push_back(Ok(text_step(text)));
        self
    }

    pub fn with_step(self, step: Result<StepResult, ProviderError>) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    pub fn with_deltas(mut self, deltas: Vec<Result<StreamDelta, ProviderError>>) -> Self {
        self.deltas = deltas;
        self
    }

    /// Delay applied before every step and before the delta stream opens.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn step(&self, request: &GenerationRequest) -> Result<StepResult, ProviderError> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.steps.lock().pop_front();
        next.unwrap_or_else(|| Err(ProviderError::Unavailable("no scripted step left".into())))
    }

    async fn deltas(&self, request: &GenerationRequest) -> Result<DeltaStream, ProviderError> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(stream::iter(self.deltas.clone()).boxed())
    }
}

pub fn finish() -> Result<StreamDelta, ProviderError> {
    Ok(StreamDelta::Finish {
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 5,
            output_tokens: 2,
        },
    })
}

pub fn token(text: &str) -> Result<StreamDelta, ProviderError> {
    Ok(StreamDelta::Text(text.to_string()))
}

// ============ Embedding ============

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> usize {
        8
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding service unavailable")
    }
}

// ============ Vector index ============

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQuery {
    pub index: String,
    pub namespace: String,
    pub top_k: usize,
    pub filter: Metadata,
}

/// In-memory index that records queries and can be told to fail or stall
/// specific namespaces.
#[derive(Default)]
pub struct RecordingIndex {
    pub inner: InMemoryVectorIndex,
    queries: Mutex<Vec<RecordedQuery>>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, namespace: &str) -> Self {
        self.failing.insert(namespace.to_string());
        self
    }

    /// Queries against `namespace` never complete.
    pub fn stalled(mut self, namespace: &str) -> Self {
        self.stalled.insert(namespace.to_string());
        self
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().clone()
    }

    pub fn queried_namespaces(&self) -> Vec<String> {
        let mut ns: Vec<String> = self.queries().into_iter().map(|q| q.namespace).collect();
        ns.sort();
        ns
    }
}

#[async_trait]
impl VectorIndex for RecordingIndex {
    async fn upsert(&self, index: &str, namespace: &str, records: Vec<IndexRecord>) -> Result<usize> {
        self.inner.upsert(index, namespace, records).await
    }

    async fn query(&self, index: &str, namespace: &str, query: &IndexQuery) -> Result<Vec<IndexMatch>> {
        self.queries.lock().push(RecordedQuery {
            index: index.to_string(),
            namespace: namespace.to_string(),
            top_k: query.top_k,
            filter: query.filter.clone(),
        });
        if self.failing.contains(namespace) {
            bail!("index shard for {} is down", namespace);
        }
        if self.stalled.contains(namespace) {
            std::future::pending::<()>().await;
        }
        self.inner.query(index, namespace, query).await
    }
}

// ============ Research lookups ============

#[derive(Clone)]
pub enum Outcome {
    Found(Value),
    NotFound,
    Fail(String),
}

/// Lookup that returns a fixed outcome after an optional delay.
pub struct StaticLookup {
    name: String,
    outcome: Outcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticLookup {
    pub fn new(name: &str, outcome: Outcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LookupSource for StaticLookup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, _subject: &Subject) -> Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Outcome::Found(v) => Ok(Some(v.clone())),
            Outcome::NotFound => Ok(None),
            Outcome::Fail(msg) => bail!("{}", msg),
        }
    }
}

// ============ Wiring ============

/// Services over the built-in partitions with explicit collaborators.
pub fn services(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn GenerationProvider>,
    sources: Vec<Arc<dyn LookupSource>>,
) -> Services {
    Services::with_collaborators(
        config,
        Arc::new(PartitionRegistry::builtin()),
        embedder,
        index,
        provider,
        sources,
        Arc::new(InMemorySessionStore::new()),
    )
}
