//! Job records and the job state machine.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-process arrival counter. Timestamps only have millisecond resolution,
/// so same-millisecond pushes need this to keep a stable arrival order.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Failure reason used when an abort steering message terminates a job.
/// Distinct from ordinary failures: no continuation is ever created after it.
pub const ABORTED_REASON: &str = "aborted";

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be claimed.
    Pending,
    /// Job has been claimed by a worker.
    Running,
    /// Job finished successfully.
    Completed,
    /// Job failed (including abort, see [`ABORTED_REASON`]).
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) |
            (Running, Completed) | (Running, Failed) |
            // Crash/timeout recovery path
            (Running, Pending)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Queue priority. High-priority jobs are claimed before normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Normal,
    High,
}

impl JobPriority {
    /// Rank byte used in index keys; sorts High before Normal.
    pub fn rank(&self) -> char {
        match self {
            Self::High => '0',
            Self::Normal => '1',
        }
    }
}

/// Execution category, selecting the health-monitor timeout tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    #[default]
    Standard,
    LongRunning,
}

/// Opaque request carried by a job, plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    /// The work request text.
    pub request: String,
    /// Conversation the originating message belongs to.
    pub conversation: String,
    /// Who asked for the work.
    pub sender: String,
    /// Set on continuation jobs: reuse this session instead of opening one.
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Optional coaching note injected on re-enqueue.
    #[serde(default)]
    pub coaching: Option<String>,
    /// Optional workflow identifier for plan/coaching lookup.
    #[serde(default)]
    pub workflow: Option<String>,
}

impl JobPayload {
    /// Payload for a fresh, human-originated request.
    pub fn new(
        request: impl Into<String>,
        conversation: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            request: request.into(),
            conversation: conversation.into(),
            sender: sender.into(),
            session_id: None,
            coaching: None,
            workflow: None,
        }
    }

    /// Payload for a silent continuation of an in-flight session.
    pub fn continuation(&self, session_id: Uuid, coaching: Option<String>) -> Self {
        Self {
            request: self.request.clone(),
            conversation: self.conversation.clone(),
            sender: self.sender.clone(),
            session_id: Some(session_id),
            coaching,
            workflow: self.workflow.clone(),
        }
    }
}

/// One unit of enqueued agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Partition and serialization unit: one worker at a time per key.
    pub project_key: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub category: JobCategory,
    pub created_at: DateTime<Utc>,
    /// Arrival tie-break for jobs created in the same millisecond.
    #[serde(default)]
    pub seq: u64,
    /// Stamped when a worker claims the job.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason for a Failed terminal, if any.
    pub failure_reason: Option<String>,
    /// True once the job has been through crash/timeout recovery.
    #[serde(default)]
    pub recovered: bool,
}

impl Job {
    /// Create a new Pending job.
    pub fn new(
        project_key: impl Into<String>,
        payload: JobPayload,
        priority: JobPriority,
        category: JobCategory,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_key: project_key.into(),
            status: JobStatus::Pending,
            payload,
            priority,
            category,
            created_at: Utc::now(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            recovered: false,
        }
    }

    /// Whether this job was terminated by an abort steering message.
    pub fn is_aborted(&self) -> bool {
        self.status == JobStatus::Failed
            && self.failure_reason.as_deref() == Some(ABORTED_REASON)
    }
}
