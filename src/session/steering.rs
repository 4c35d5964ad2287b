//! Per-session steering mailbox.
//!
//! An ephemeral FIFO of live correction/abort messages, consumed only at
//! execution checkpoints. Entries are time-boxed and the whole mailbox is
//! cleared when its session reaches a terminal state, so a reused identifier
//! never inherits stale instructions.
//!
//! Keys: `steer:{session_id}:{millis:013}:{seq:020}:{uuid}` — the zero-padded
//! timestamp plus a per-process arrival sequence makes a sorted prefix scan
//! FIFO even for same-millisecond pushes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SteeringError;
use crate::store::KvStore;

/// A live instruction injected into a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringMessage {
    pub session_id: Uuid,
    pub text: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    /// Abort wins over everything else queued at the same checkpoint.
    pub is_abort: bool,
    /// Entries past this point are dropped, never delivered.
    pub expires_at: DateTime<Utc>,
}

fn mailbox_prefix(session_id: Uuid) -> String {
    format!("steer:{session_id}:")
}

/// Arrival tie-break for messages pushed in the same millisecond.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Time-bounded FIFO mailboxes keyed by session id.
#[derive(Clone)]
pub struct SteeringChannel {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SteeringChannel {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Append a message to the session's mailbox.
    pub async fn push(
        &self,
        session_id: Uuid,
        text: &str,
        sender: &str,
        is_abort: bool,
    ) -> Result<(), SteeringError> {
        let now = Utc::now();
        let message = SteeringMessage {
            session_id,
            text: text.to_string(),
            sender: sender.to_string(),
            timestamp: now,
            is_abort,
            expires_at: now
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1)),
        };

        let key = format!(
            "{}{:013}:{:020}:{}",
            mailbox_prefix(session_id),
            now.timestamp_millis().max(0),
            NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            Uuid::new_v4()
        );
        let raw = serde_json::to_string(&message).map_err(|e| SteeringError::Store(e.into()))?;
        self.kv.put(&key, &raw).await?;

        debug!(session_id = %session_id, is_abort, "Steering message queued");
        Ok(())
    }

    /// Remove and return all live messages in FIFO order, in one pass.
    ///
    /// Expired entries are deleted without being returned. After this call
    /// the mailbox is empty.
    pub async fn drain(&self, session_id: Uuid) -> Result<Vec<SteeringMessage>, SteeringError> {
        let entries = self.kv.list(&mailbox_prefix(session_id)).await?;
        let now = Utc::now();
        let mut messages = Vec::new();

        for (key, raw) in entries {
            self.kv.delete(&key).await?;
            match serde_json::from_str::<SteeringMessage>(&raw) {
                Ok(message) if message.expires_at > now => messages.push(message),
                Ok(message) => {
                    debug!(session_id = %session_id, age = %(now - message.timestamp), "Dropped expired steering message");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Dropped unreadable steering message");
                }
            }
        }

        Ok(messages)
    }

    /// Discard the entire mailbox. Called when the owning session goes
    /// terminal.
    pub async fn clear(&self, session_id: Uuid) -> Result<(), SteeringError> {
        let entries = self.kv.list(&mailbox_prefix(session_id)).await?;
        for (key, _) in entries {
            self.kv.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn channel(ttl: Duration) -> SteeringChannel {
        SteeringChannel::new(Arc::new(MemoryKv::new()), ttl)
    }

    #[tokio::test]
    async fn drain_returns_fifo_and_empties_mailbox() {
        let channel = channel(Duration::from_secs(60));
        let sid = Uuid::new_v4();
        channel.push(sid, "first", "alice", false).await.unwrap();
        channel.push(sid, "second", "alice", false).await.unwrap();
        channel.push(sid, "third", "bob", false).await.unwrap();

        let messages = channel.drain(sid).await.unwrap();
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);

        assert!(channel.drain(sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rapid_burst_drains_in_push_order() {
        let channel = channel(Duration::from_secs(60));
        let sid = Uuid::new_v4();
        // All of these usually land in the same millisecond.
        for i in 0..20 {
            channel.push(sid, &format!("m{i}"), "alice", false).await.unwrap();
        }

        let messages = channel.drain(sid).await.unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.text.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn mailboxes_are_isolated_per_session() {
        let channel = channel(Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        channel.push(a, "for a", "alice", false).await.unwrap();

        assert!(channel.drain(b).await.unwrap().is_empty());
        assert_eq!(channel.drain(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_messages_are_dropped_not_delivered() {
        let channel = channel(Duration::from_millis(10));
        let sid = Uuid::new_v4();
        channel.push(sid, "stale", "alice", false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(channel.drain(sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_discards_everything() {
        let channel = channel(Duration::from_secs(60));
        let sid = Uuid::new_v4();
        channel.push(sid, "one", "alice", false).await.unwrap();
        channel.push(sid, "stop", "alice", true).await.unwrap();

        channel.clear(sid).await.unwrap();
        assert!(channel.drain(sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_flag_round_trips() {
        let channel = channel(Duration::from_secs(60));
        let sid = Uuid::new_v4();
        channel.push(sid, "abort", "alice", true).await.unwrap();
        let messages = channel.drain(sid).await.unwrap();
        assert!(messages[0].is_abort);
    }
}
