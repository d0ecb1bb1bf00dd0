//! Stream sessions: bridge an asynchronous generation task to a client
//! that reads its output later through an opaque token.
//!
//! The producer side is [`SessionManager::push_event`] (usually through a
//! [`SessionSink`]). The consumer side is [`SessionManager::subscribe`],
//! a finite lazy stream that drains the session log from a cursor.
//!
//! Storage sits behind [`SessionStore`]. The in-memory store only works
//! for a single process; a multi-instance deployment needs a shared store
//! with per-key expiry behind the same trait.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::events::{EventSink, StreamEvent};

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub token: String,
    pub events: Vec<StreamEvent>,
    /// Set once a `done` or `error` event has been appended.
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            events: Vec::new(),
            terminal: false,
            created_at: Utc::now(),
        }
    }
}

/// Token-keyed session storage with per-session expiry.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store an empty session that disappears after `ttl`.
    async fn create(&self, token: &str, ttl: Duration) -> Result<()>;

    /// Append an event. Returns `false` if the session is gone or already
    /// terminal, in which case nothing is stored.
    async fn append(&self, token: &str, event: StreamEvent) -> Result<bool>;

    async fn get(&self, token: &str) -> Result<Option<SessionRecord>>;

    /// Delete a session immediately.
    async fn expire(&self, token: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub heartbeat_after: Duration,
    pub max_duration: Duration,
}

impl From<&StreamConfig> for SessionSettings {
    fn from(c: &StreamConfig) -> Self {
        Self {
            ttl: c.session_ttl(),
            poll_interval: c.poll_interval(),
            heartbeat_after: c.heartbeat_after(),
            max_duration: c.max_duration(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    settings: SessionSettings,
}

/// Generate an unguessable session token: two v4 UUIDs as 64 hex chars.
fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, settings: SessionSettings) -> Self {
        Self { store, settings }
    }

    /// Create an empty session and return its token.
    pub async fn create_session(&self) -> Result<String> {
        let token = new_token();
        self.store.create(&token, self.settings.ttl).await?;
        debug!(token = %short(&token), ttl_secs = self.settings.ttl.as_secs(), "session created");
        Ok(token)
    }

    /// Append an event. Never fails: a missing or finished session is
    /// ignored so the producer never blocks on an absent consumer.
    pub async fn push_event(&self, token: &str, event: StreamEvent) {
        let name = event.name();
        match self.store.append(token, event).await {
            Ok(true) => {}
            Ok(false) => debug!(token = %short(token), event = name, "event dropped, session gone or finished"),
            Err(e) => warn!(token = %short(token), event = name, error = %e, "session append failed"),
        }
    }

    pub async fn get_session(&self, token: &str) -> Result<Option<SessionRecord>> {
        self.store.get(token).await
    }

    /// Lazy, finite event sequence for `token`.
    ///
    /// Polls the session every `poll_interval`, yielding every event past
    /// the cursor. Ends after a terminal event, when the session vanishes,
    /// or when `max_duration` elapses (yielding an `error` first). Emits a
    /// `heartbeat` after `heartbeat_after` without any delivery. An unknown
    /// or expired token yields a single `error` event.
    pub fn subscribe(&self, token: &str) -> BoxStream<'static, StreamEvent> {
        let store = self.store.clone();
        let settings = self.settings.clone();
        let token = token.to_string();

        let stream = async_stream::stream! {
            let started = Instant::now();
            let mut last_delivery = started;
            let mut cursor = 0usize;
            let mut first_poll = true;

            loop {
                if started.elapsed() >= settings.max_duration {
                    yield StreamEvent::error("stream deadline exceeded");
                    break;
                }

                let record = match store.get(&token).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(token = %short(&token), error = %e, "session read failed");
                        None
                    }
                };
                let Some(record) = record else {
                    if first_poll {
                        yield StreamEvent::error("session expired or unknown");
                    }
                    break;
                };
                first_poll = false;

                if record.events.len() > cursor {
                    for event in record.events[cursor..].iter().cloned() {
                        yield event;
                    }
                    cursor = record.events.len();
                    last_delivery = Instant::now();
                }
                if record.terminal {
                    break;
                }

                if last_delivery.elapsed() >= settings.heartbeat_after {
                    yield StreamEvent::Heartbeat;
                    last_delivery = Instant::now();
                }

                tokio::time::sleep(settings.poll_interval).await;
            }
        };
        stream.boxed()
    }
}

/// Abbreviated token for log lines.
fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

/// [`EventSink`] that appends into one session.
pub struct SessionSink {
    manager: Arc<SessionManager>,
    token: String,
}

impl SessionSink {
    pub fn new(manager: Arc<SessionManager>, token: impl Into<String>) -> Self {
        Self {
            manager,
            token: token.into(),
        }
    }
}

#[async_trait]
impl EventSink for SessionSink {
    async fn emit(&self, event: StreamEvent) {
        self.manager.push_event(&self.token, event).await;
    }
}
