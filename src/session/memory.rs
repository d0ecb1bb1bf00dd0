//! In-process [`SessionStore`]: a map plus one expiry timer per session.
//!
//! Reads also check the deadline, so a session is never observed past its
//! lifetime even if its timer task has not run yet.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{SessionRecord, SessionStore};
use crate::events::StreamEvent;

struct Entry {
    record: SessionRecord,
    expires_at: Instant,
}

#[derive(Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions (including ones past their deadline whose
    /// timer has not fired yet).
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, token: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.sessions.lock().insert(
            token.to_string(),
            Entry {
                record: SessionRecord::new(token),
                expires_at,
            },
        );

        let sessions = Arc::clone(&self.sessions);
        let token = token.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let mut guard = sessions.lock();
            if guard.get(&token).is_some_and(|e| e.expires_at <= Instant::now()) {
                guard.remove(&token);
            }
        });
        Ok(())
    }

    async fn append(&self, token: &str, event: StreamEvent) -> Result<bool> {
        let mut guard = self.sessions.lock();
        let (expired, terminal) = match guard.get(token) {
            None => return Ok(false),
            Some(entry) => (entry.expires_at <= Instant::now(), entry.record.terminal),
        };
        if expired {
            guard.remove(token);
            return Ok(false);
        }
        if terminal {
            return Ok(false);
        }
        if let Some(entry) = guard.get_mut(token) {
            entry.record.terminal = event.is_terminal();
            entry.record.events.push(event);
        }
        Ok(true)
    }

    async fn get(&self, token: &str) -> Result<Option<SessionRecord>> {
        let mut guard = self.sessions.lock();
        let expired = match guard.get(token) {
            None => return Ok(None),
            Some(entry) => entry.expires_at <= Instant::now(),
        };
        if expired {
            guard.remove(token);
            return Ok(None);
        }
        Ok(guard.get(token).map(|e| e.record.clone()))
    }

    async fn expire(&self, token: &str) -> Result<()> {
        self.sessions.lock().remove(token);
        Ok(())
    }
}
