//! Generation backend abstraction.
//!
//! A [`GenerationProvider`] runs one stateless generation exchange. The
//! caller owns any multi-turn loop. Each backend is a separate
//! implementation chosen once at startup by [`create_provider`]:
//!
//! - **`anthropic`**: Messages API ([`anthropic::AnthropicProvider`]).
//! - **`openai`**: Chat Completions API ([`openai::OpenAiProvider`]).
//! - **`disabled`**: fails every call with [`ProviderError::NotConfigured`].
//!
//! Backend failures surface as [`ProviderError`]. Its messages never carry
//! backend-specific vocabulary.
//!
//! # Streaming contract
//!
//! [`GenerationProvider::stream_step`] emits zero or more `token` events,
//! a `tool_call` event when the model invokes a tool, and then exactly one
//! terminal event (`done` or `error`). Backends only
//! implement [`GenerationProvider::deltas`]; the default `stream_step` turns
//! that delta stream into events and guarantees the terminal event.

pub mod anthropic;
pub mod openai;
pub mod sse;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

use crate::config::GenerationConfig;
use crate::events::{EventSink, StreamEvent};

// ═══════════════════════════════════════════════════════════════════════
// Request / result types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A tool the model may invoke. `input_schema` is a JSON Schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema", alias = "parameters")]
    pub input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    Text {
        text: String,
    },
    ToolInvocation {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// Outcome of one buffered generation exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    #[serde(flatten)]
    pub output: StepOutput,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// Backend-assigned run identifier.
    pub run_id: String,
    pub latency_ms: u64,
}

impl StepResult {
    /// The text output, if this step produced text.
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            StepOutput::Text { text } => Some(text),
            StepOutput::ToolInvocation { .. } => None,
        }
    }
}

/// Incremental output from a streaming exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    /// A fully assembled tool call.
    ToolInvocation {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    Finish { stop_reason: StopReason, usage: Usage },
}

pub type DeltaStream = BoxStream<'static, Result<StreamDelta, ProviderError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Error,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("generation backend timed out")]
    Timeout,

    #[error("generation backend is rate limiting requests")]
    RateLimited,

    #[error("generation backend rejected the request (status {status})")]
    Rejected { status: u16 },

    #[error("generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed generation response: {0}")]
    Malformed(String),

    #[error("generation backend is not configured")]
    NotConfigured,
}

impl ProviderError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            408 | 504 => ProviderError::Timeout,
            429 => ProviderError::RateLimited,
            s if status.is_server_error() => ProviderError::Unavailable(format!("status {}", s)),
            s => {
                warn!(status = s, message = %extract_error_message(&body), "generation backend rejected request");
                ProviderError::Rejected { status: s }
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::Timeout;
        }
        warn!(error = %err, "generation backend request failed");
        if err.is_decode() {
            ProviderError::Malformed("undecodable response body".into())
        } else {
            ProviderError::Unavailable("request failed".into())
        }
    }
}

/// Pull `error.message` out of a JSON error body, falling back to the raw
/// text.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(300).collect())
}

// ═══════════════════════════════════════════════════════════════════════
// Trait
// ═══════════════════════════════════════════════════════════════════════

/// One interchangeable generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Backend name (`"anthropic"`, `"openai"`, ...).
    fn name(&self) -> &str;

    /// Run one buffered exchange.
    async fn step(&self, request: &GenerationRequest) -> Result<StepResult, ProviderError>;

    /// Open a streaming exchange and return its raw deltas.
    async fn deltas(&self, request: &GenerationRequest) -> Result<DeltaStream, ProviderError>;

    /// Run one streaming exchange, emitting `token` events and then exactly
    /// one terminal event. Returns the terminal event.
    async fn stream_step(&self, request: &GenerationRequest, sink: &dyn EventSink) -> StreamEvent {
        let terminal = match self.deltas(request).await {
            Err(e) => StreamEvent::error(e.to_string()),
            Ok(mut stream) => loop {
                match stream.next().await {
                    Some(Ok(StreamDelta::Text(text))) => {
                        if !text.is_empty() {
                            sink.emit(StreamEvent::Token { text }).await;
                        }
                    }
                    Some(Ok(StreamDelta::ToolInvocation { call_id, name, input })) => {
                        sink.emit(StreamEvent::ToolCall { call_id, name, input }).await;
                    }
                    Some(Ok(StreamDelta::Finish { stop_reason, usage })) => {
                        break StreamEvent::Done { stop_reason, usage };
                    }
                    Some(Err(e)) => break StreamEvent::error(e.to_string()),
                    None => {
                        break StreamEvent::error(
                            ProviderError::Malformed("stream ended before completion".into())
                                .to_string(),
                        )
                    }
                }
            },
        };
        sink.emit(terminal.clone()).await;
        terminal
    }

    /// Minimal round-trip to the backend.
    async fn health_check(&self) -> Health {
        let started = Instant::now();
        let ping = GenerationRequest {
            messages: vec![Message::user("ping")],
            max_tokens: Some(1),
            ..Default::default()
        };
        let result = self.step(&ping).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => Health {
                status: HealthStatus::Ok,
                latency_ms,
                error: None,
            },
            Err(ProviderError::NotConfigured) => Health {
                status: HealthStatus::Disabled,
                latency_ms,
                error: None,
            },
            Err(e) => Health {
                status: HealthStatus::Error,
                latency_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Disabled backend and construction
// ═══════════════════════════════════════════════════════════════════════

/// Backend used when `generation.provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl GenerationProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn step(&self, _request: &GenerationRequest) -> Result<StepResult, ProviderError> {
        Err(ProviderError::NotConfigured)
    }

    async fn deltas(&self, _request: &GenerationRequest) -> Result<DeltaStream, ProviderError> {
        Err(ProviderError::NotConfigured)
    }
}

/// Build the backend named by `config.provider`.
pub fn create_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(config)?)),
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Read the API key for a backend from the configured (or default)
/// environment variable.
pub(crate) fn api_key(config: &GenerationConfig, default_env: &str) -> Result<String> {
    let env = config.api_key_env.as_deref().unwrap_or(default_env);
    match std::env::var(env) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => bail!("{} environment variable not set", env),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<StreamEvent>>);

    #[async_trait]
    impl EventSink for Collect {
        async fn emit(&self, event: StreamEvent) {
            self.0.lock().push(event);
        }
    }

    struct Canned(Vec<Result<StreamDelta, ProviderError>>);

    #[async_trait]
    impl GenerationProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        async fn step(&self, _r: &GenerationRequest) -> Result<StepResult, ProviderError> {
            Err(ProviderError::NotConfigured)
        }
        async fn deltas(&self, _r: &GenerationRequest) -> Result<DeltaStream, ProviderError> {
            Ok(stream::iter(self.0.clone()).boxed())
        }
    }

    async fn run(deltas: Vec<Result<StreamDelta, ProviderError>>) -> Vec<StreamEvent> {
        let sink = Collect(Mutex::new(Vec::new()));
        Canned(deltas)
            .stream_step(&GenerationRequest::default(), &sink)
            .await;
        sink.0.into_inner()
    }

    fn terminal_count(events: &[StreamEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let events = run(vec![
            Ok(StreamDelta::Text("Hel".into())),
            Ok(StreamDelta::Text("lo".into())),
            Ok(StreamDelta::Finish {
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 4,
                    output_tokens: 2,
                },
            }),
            Ok(StreamDelta::Text("ignored".into())),
        ])
        .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Token { text: "Hel".into() });
        assert!(matches!(events[2], StreamEvent::Done { .. }));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_stream_error_is_terminal() {
        let events = run(vec![
            Ok(StreamDelta::Text("partial".into())),
            Err(ProviderError::Timeout),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Error { .. }));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_truncated_stream_still_terminates() {
        let events = run(vec![Ok(StreamDelta::Text("a".into()))]).await;
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_disabled_backend() {
        let p = create_provider(&GenerationConfig::default()).unwrap();
        assert_eq!(p.name(), "disabled");
        assert_eq!(
            p.step(&GenerationRequest::default()).await.unwrap_err(),
            ProviderError::NotConfigured
        );
        assert_eq!(p.health_check().await.status, HealthStatus::Disabled);

        let sink = Collect(Mutex::new(Vec::new()));
        p.stream_step(&GenerationRequest::default(), &sink).await;
        let events = sink.0.into_inner();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert_eq!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ProviderError::RateLimited
        );
        assert_eq!(
            ProviderError::from_status(StatusCode::GATEWAY_TIMEOUT, String::new()),
            ProviderError::Timeout
        );
        assert_eq!(
            ProviderError::from_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"max_tokens too large"}}"#.into()
            ),
            ProviderError::Rejected { status: 400 }
        );
    }

    #[test]
    fn test_rejection_message_hides_backend_text() {
        let err = ProviderError::from_status(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"error":{"type":"authentication_error","message":"invalid x-api-key"}}"#.into(),
        );
        let message = err.to_string();
        assert_eq!(message, "generation backend rejected the request (status 401)");
        assert!(!message.contains("x-api-key"));
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"invalid x-api-key"}}"#),
            "invalid x-api-key"
        );
    }

    #[tokio::test]
    async fn test_stream_tool_call_precedes_done() {
        let events = run(vec![
            Ok(StreamDelta::ToolInvocation {
                call_id: "tu_1".into(),
                name: "lookup".into(),
                input: serde_json::json!({"dot": "123"}),
            }),
            Ok(StreamDelta::Finish {
                stop_reason: StopReason::ToolUse,
                usage: Usage::default(),
            }),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCall { name, input, .. } if name == "lookup" && input["dot"] == "123"
        ));
        assert!(matches!(
            events[1],
            StreamEvent::Done { stop_reason: StopReason::ToolUse, .. }
        ));
    }
}
