//! Session lifecycle tracking.
//!
//! A session is the human-facing conversational record bound to a job's
//! execution, tracked independently of the job's own state machine: a job can
//! fail while its session finalizes gracefully, and vice versa during a crash.
//!
//! Layout on the key/value backend:
//! - `session:{id}` — the full JSON record.
//! - `session-active:{project_key}:{conversation}` — uniqueness slot, value is
//!   the session id. At most one active session per slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::store::{KvStore, escape_segment};

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Work is executing on behalf of this session right now.
    Active,
    /// Delivered and waiting on a human; a reply starts fresh work.
    Dormant,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Dormant => "dormant",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The human-facing work session bound to job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub project_key: String,
    pub conversation: String,
    pub status: SessionStatus,
    /// Chat/sender reference the session originated from.
    pub origin_sender: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub tool_call_count: u32,
    /// Consecutive silent continuations; reset on any human input.
    pub auto_continue_count: u32,
}

fn record_key(id: Uuid) -> String {
    format!("session:{id}")
}

fn active_key(project_key: &str, conversation: &str) -> String {
    // Escaped segments: a `:` in either part must not collide with another
    // slot's key.
    format!(
        "session-active:{}:{}",
        escape_segment(project_key),
        escape_segment(conversation)
    )
}

/// Tracks session records and the active-slot uniqueness constraint.
#[derive(Clone)]
pub struct SessionTracker {
    kv: Arc<dyn KvStore>,
}

impl SessionTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Open a new active session for `(project_key, conversation)`.
    ///
    /// If the slot already holds an active session, that one is marked Failed
    /// (superseded) first — never a destructive error.
    pub async fn begin(
        &self,
        project_key: &str,
        conversation: &str,
        sender: &str,
    ) -> Result<Session, SessionError> {
        let slot = active_key(project_key, conversation);

        if let Some(old_id) = self.kv.get(&slot).await? {
            if let Ok(old_id) = Uuid::parse_str(&old_id) {
                warn!(old_session = %old_id, project = %project_key, "Superseding stale active session");
                // Ignore NotFound: a dangling slot entry is repaired by the
                // overwrite below either way.
                let _ = self.finalize(old_id, SessionStatus::Failed).await;
            }
            self.kv.delete(&slot).await?;
        }

        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            project_key: project_key.to_string(),
            conversation: conversation.to_string(),
            status: SessionStatus::Active,
            origin_sender: sender.to_string(),
            created_at: now,
            last_activity: now,
            tool_call_count: 0,
            auto_continue_count: 0,
        };

        self.kv
            .put(&record_key(session.session_id), &serialize(&session)?)
            .await?;
        self.kv.put(&slot, &session.session_id.to_string()).await?;

        info!(session_id = %session.session_id, project = %project_key, "Session opened");
        Ok(session)
    }

    /// Get a session by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Session>, SessionError> {
        match self.kv.get(&record_key(id)).await? {
            Some(raw) => Ok(Some(deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Look up the active session for a `(project_key, conversation)` slot.
    pub async fn active_for(
        &self,
        project_key: &str,
        conversation: &str,
    ) -> Result<Option<Session>, SessionError> {
        let Some(id) = self.kv.get(&active_key(project_key, conversation)).await? else {
            return Ok(None);
        };
        let Ok(id) = Uuid::parse_str(&id) else {
            return Ok(None);
        };
        match self.get(id).await? {
            Some(session) if session.status == SessionStatus::Active => Ok(Some(session)),
            _ => Ok(None),
        }
    }

    /// Bump `last_activity`.
    pub async fn touch(&self, id: Uuid) -> Result<(), SessionError> {
        self.update(id, |s| s.last_activity = Utc::now()).await?;
        Ok(())
    }

    /// Record one agent tool call against the session.
    pub async fn record_tool_call(&self, id: Uuid) -> Result<(), SessionError> {
        self.update(id, |s| {
            s.tool_call_count += 1;
            s.last_activity = Utc::now();
        })
        .await?;
        Ok(())
    }

    /// Increment the silent-continuation counter. Returns the new count.
    pub async fn increment_auto_continue(&self, id: Uuid) -> Result<u32, SessionError> {
        let session = self
            .update(id, |s| {
                s.auto_continue_count += 1;
                s.last_activity = Utc::now();
            })
            .await?;
        Ok(session.auto_continue_count)
    }

    /// Reset the continuation counter. Called on any human-originated input.
    pub async fn reset_auto_continue(&self, id: Uuid) -> Result<(), SessionError> {
        self.update(id, |s| {
            s.auto_continue_count = 0;
            s.last_activity = Utc::now();
        })
        .await?;
        Ok(())
    }

    /// Move a session to a terminal status and release its active slot.
    ///
    /// The steering mailbox is cleared by the engine alongside this call, so a
    /// reused conversation never inherits stale instructions.
    pub async fn finalize(&self, id: Uuid, status: SessionStatus) -> Result<Session, SessionError> {
        let session = self.get(id).await?.ok_or(SessionError::NotFound { id })?;
        if session.status.is_terminal() {
            return Err(SessionError::AlreadyTerminal {
                id,
                status: session.status.to_string(),
            });
        }

        let mut next = session;
        next.status = status;
        next.last_activity = Utc::now();
        self.kv.put(&record_key(id), &serialize(&next)?).await?;

        let slot = active_key(&next.project_key, &next.conversation);
        if let Some(holder) = self.kv.get(&slot).await? {
            if holder == id.to_string() {
                self.kv.delete(&slot).await?;
            }
        }

        info!(session_id = %id, status = %status, "Session finalized");
        Ok(next)
    }

    /// Crash/shutdown path: mark every session this process owns that is
    /// still active as Failed, immediately.
    pub async fn fail_all_active(&self) -> Result<usize, SessionError> {
        let slots = self.kv.list("session-active:").await?;
        let mut failed = 0;
        for (slot, id) in slots {
            let Ok(id) = Uuid::parse_str(&id) else {
                self.kv.delete(&slot).await?;
                continue;
            };
            match self.finalize(id, SessionStatus::Failed).await {
                Ok(_) => failed += 1,
                Err(SessionError::NotFound { .. }) | Err(SessionError::AlreadyTerminal { .. }) => {
                    self.kv.delete(&slot).await?;
                }
                Err(e) => return Err(e),
            }
        }
        if failed > 0 {
            warn!(count = failed, "Marked active sessions failed on shutdown");
        }
        Ok(failed)
    }

    /// List every active session (monitor surface).
    pub async fn list_active(&self) -> Result<Vec<Session>, SessionError> {
        let slots = self.kv.list("session-active:").await?;
        let mut sessions = Vec::new();
        for (_, id) in slots {
            let Ok(id) = Uuid::parse_str(&id) else { continue };
            if let Some(session) = self.get(id).await? {
                if session.status == SessionStatus::Active {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn update(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<Session, SessionError> {
        let mut session = self.get(id).await?.ok_or(SessionError::NotFound { id })?;
        mutate(&mut session);
        self.kv.put(&record_key(id), &serialize(&session)?).await?;
        debug!(session_id = %id, "Session updated");
        Ok(session)
    }
}

fn serialize(session: &Session) -> Result<String, SessionError> {
    serde_json::to_string(session).map_err(|e| SessionError::Store(e.into()))
}

fn deserialize(raw: &str) -> Result<Session, SessionError> {
    serde_json::from_str(raw).map_err(|e| SessionError::Store(e.into()))
}
