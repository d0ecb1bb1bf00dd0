//! Events produced by a streamed generation step and buffered in stream
//! sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::{StopReason, Usage};

/// One delivery on a stream.
///
/// `Done` and `Error` are terminal: a session never accepts another event
/// after either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Token {
        text: String,
    },
    /// The model asked for a tool. Always followed by `done` with
    /// `stop_reason: tool_use`.
    ToolCall {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    Done { stop_reason: StopReason, usage: Usage },
    Error { message: String },
    Heartbeat,
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Event name used on the wire (`token`, `tool_call`, `done`, `error`,
    /// `heartbeat`).
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Heartbeat => "heartbeat",
        }
    }
}

/// Receiver for events emitted by a streaming generation step.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent);
}
