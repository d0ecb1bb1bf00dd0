//! Generation turns: optional intent-scoped retrieval, prompt
//! augmentation, and one generation step (buffered or streamed).
//!
//! One deadline covers the whole turn. Classification, retrieval, and
//! generation all draw from the same budget, measured from entry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use knowledge_relay_core::intent::Intent;
use knowledge_relay_core::models::{Metadata, NoContextReason};

use crate::config::{GenerationConfig, TurnConfig};
use crate::error::RelayError;
use crate::events::StreamEvent;
use crate::intent::IntentClassifier;
use crate::provider::{GenerationProvider, GenerationRequest, Message, Role, StepResult, ToolDefinition};
use crate::retrieval::{RetrievalRequest, Retriever};
use crate::session::{SessionManager, SessionSink};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// When present, the last user message is used as a retrieval query
    /// and the resulting context block is added to the system prompt.
    #[serde(default)]
    pub retrieval: Option<TurnRetrieval>,
}

/// Retrieval settings carried by a turn. The query is the turn's last
/// user message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRetrieval {
    pub role: String,
    /// Partitions to search. When empty (and no filters are given) the
    /// message is classified and its intent picks the partitions.
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: HashMap<String, Metadata>,
    #[serde(default)]
    pub budget_tokens: Option<usize>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// What retrieval contributed to a turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextSummary {
    pub chunks: usize,
    pub tokens: usize,
    pub partitions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_context_reason: Option<NoContextReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    #[serde(flatten)]
    pub step: StepResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStart {
    pub token: String,
    pub events_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSummary>,
}

pub struct TurnOrchestrator {
    provider: Arc<dyn GenerationProvider>,
    retriever: Arc<Retriever>,
    intents: Arc<IntentClassifier>,
    sessions: Arc<SessionManager>,
    deadline: Duration,
    max_tokens_cap: u32,
}

impl TurnOrchestrator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        retriever: Arc<Retriever>,
        intents: Arc<IntentClassifier>,
        sessions: Arc<SessionManager>,
        turn: &TurnConfig,
        generation: &GenerationConfig,
    ) -> Self {
        Self {
            provider,
            retriever,
            intents,
            sessions,
            deadline: Duration::from_secs(turn.deadline_secs),
            max_tokens_cap: generation.max_tokens_cap,
        }
    }

    fn deadline_exceeded(&self) -> RelayError {
        warn!(deadline_secs = self.deadline.as_secs(), "turn deadline exceeded");
        RelayError::UpstreamTimeout("turn deadline exceeded".into())
    }

    /// Run a buffered turn.
    pub async fn run(&self, req: &TurnRequest) -> Result<TurnResponse, RelayError> {
        let deadline = Instant::now() + self.deadline;

        let (generation, context) = timeout_at(deadline, self.prepare(req))
            .await
            .map_err(|_| self.deadline_exceeded())??;
        let step = timeout_at(deadline, self.provider.step(&generation))
            .await
            .map_err(|_| self.deadline_exceeded())??;

        info!(
            provider = self.provider.name(),
            stop_reason = ?step.stop_reason,
            input_tokens = step.usage.input_tokens,
            output_tokens = step.usage.output_tokens,
            latency_ms = step.latency_ms,
            "turn complete"
        );
        Ok(TurnResponse { step, context })
    }

    /// Start a streamed turn and return the session token to read it from.
    ///
    /// Validation and retrieval happen before the session is created, so a
    /// bad request never leaves a session behind. Generation runs on a
    /// spawned task that pushes into the session with whatever remains of
    /// the turn deadline; if it fires first an `error` event ends the
    /// stream.
    pub async fn start_stream(&self, req: &TurnRequest) -> Result<StreamStart, RelayError> {
        let deadline = Instant::now() + self.deadline;
        let (generation, context) = timeout_at(deadline, self.prepare(req))
            .await
            .map_err(|_| self.deadline_exceeded())??;
        let token = self.sessions.create_session().await?;

        let provider = self.provider.clone();
        let sessions = self.sessions.clone();
        let deadline_secs = self.deadline.as_secs();
        let task_token = token.clone();
        tokio::spawn(async move {
            let sink = SessionSink::new(sessions.clone(), task_token.clone());
            match timeout_at(deadline, provider.stream_step(&generation, &sink)).await {
                Ok(StreamEvent::Error { message }) => {
                    warn!(provider = provider.name(), error = %message, "streamed turn failed");
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(deadline_secs, "streamed turn deadline exceeded");
                    sessions
                        .push_event(&task_token, StreamEvent::error("turn deadline exceeded"))
                        .await;
                }
            }
        });

        Ok(StreamStart {
            events_path: format!("/v1/stream/{}", token),
            token,
            context,
        })
    }

    async fn prepare(
        &self,
        req: &TurnRequest,
    ) -> Result<(GenerationRequest, Option<ContextSummary>), RelayError> {
        validate(req, self.max_tokens_cap)?;

        let mut system = req.system.clone().filter(|s| !s.trim().is_empty());
        let mut context = None;

        if let Some(retrieval) = &req.retrieval {
            let query = req
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let mut request = RetrievalRequest {
                query,
                role: retrieval.role.clone(),
                partitions: retrieval.partitions.clone(),
                top_k: retrieval.top_k,
                filters: retrieval.filters.clone(),
                budget_tokens: retrieval.budget_tokens,
                user_id: retrieval.user_id.clone(),
            };

            let role = retrieval.role.trim();
            let mut intent = None;
            if self.intents.enabled()
                && !role.is_empty()
                && request.partitions.is_empty()
                && request.filters.is_empty()
            {
                let classified = self
                    .intents
                    .classify(&request.query, role, &recent_context(&req.messages))
                    .await;
                request.partitions = classified.partitions.clone();
                request.filters = classified.filters.clone();
                intent = Some(classified);
            }

            let retrieval_free = intent
                .as_ref()
                .is_some_and(|i| !i.fallback && i.partitions.is_empty());
            if retrieval_free {
                context = Some(ContextSummary {
                    intent,
                    ..Default::default()
                });
            } else {
                match self.retriever.retrieve(&request).await {
                    Ok(result) => {
                        if !result.context_block.is_empty() {
                            system = Some(augment_system(system.as_deref(), &result.context_block));
                        }
                        context = Some(ContextSummary {
                            chunks: result.chunks.len(),
                            tokens: result.tokens_assembled,
                            partitions: result.partitions,
                            no_context_reason: result.no_context_reason,
                            intent,
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "retrieval skipped for turn");
                    }
                }
            }
        }

        Ok((
            GenerationRequest {
                system,
                messages: req.messages.clone(),
                tools: req.tools.clone(),
                model: req.model.clone(),
                max_tokens: req.max_tokens,
            },
            context,
        ))
    }
}

/// Up to three turns before the last message, one short line each.
fn recent_context(messages: &[Message]) -> Vec<String> {
    let earlier = &messages[..messages.len().saturating_sub(1)];
    earlier[earlier.len().saturating_sub(3)..]
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let text: String = m.content.chars().take(200).collect();
            format!("{}: {}", who, text)
        })
        .collect()
}

fn augment_system(system: Option<&str>, block: &str) -> String {
    match system {
        Some(s) => format!("{}\n\n{}", s.trim_end(), block),
        None => block.to_string(),
    }
}

/// Reject malformed turns before any external call.
pub fn validate(req: &TurnRequest, max_tokens_cap: u32) -> Result<(), RelayError> {
    let Some(last) = req.messages.last() else {
        return Err(RelayError::validation("messages must not be empty"));
    };
    if last.role != Role::User {
        return Err(RelayError::validation("the last message must come from the user"));
    }
    if let Some(i) = req.messages.iter().position(|m| m.content.trim().is_empty()) {
        return Err(RelayError::validation(format!(
            "messages[{}].content must not be empty",
            i
        )));
    }
    if let Some(n) = req.max_tokens {
        if n == 0 || n > max_tokens_cap {
            return Err(RelayError::validation(format!(
                "max_tokens must be in [1, {}]",
                max_tokens_cap
            )));
        }
    }

    let mut seen = HashSet::new();
    for tool in &req.tools {
        let name = tool.name.trim();
        if name.is_empty() {
            return Err(RelayError::validation("tool names must not be empty"));
        }
        if !seen.insert(name) {
            return Err(RelayError::validation(format!("duplicate tool name '{}'", name)));
        }
    }
    Ok(())
}
