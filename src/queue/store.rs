//! Durable job storage with a status-partitioned index.
//!
//! Layout on the key/value backend:
//!
//! - `job:{id}` — the full JSON record. Source of truth for status.
//! - `jobidx:{status}:{project}:{rank}{created_millis}:{seq}:{id}` — index
//!   entry, value is the job id; the project segment is escaped so `:` in a
//!   key cannot cross partition boundaries. A sorted prefix scan of the
//!   pending partition yields priority-then-arrival order, with the arrival
//!   sequence breaking same-millisecond ties.
//!
//! The backend has no transactions, so every status change goes through
//! [`JobStore::transition`]: construct the full new record, swap it in, add the
//! new index entry, then discard the old entry. The status field is never
//! mutated in place against a live index. Any crash window this leaves behind
//! is repaired by [`JobStore::recover_orphans`] and by `pop`, which deletes
//! index entries whose record disagrees instead of surfacing them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::job::{Job, JobCategory, JobPayload, JobPriority, JobStatus};
use crate::store::{KvStore, escape_segment};

/// Job store and queue over a key/value backend.
#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn KvStore>,
}

fn record_key(id: Uuid) -> String {
    format!("job:{id}")
}

fn index_key(job: &Job, status: JobStatus) -> String {
    format!(
        "jobidx:{}:{}:{}{:013}:{:020}:{}",
        status,
        escape_segment(&job.project_key),
        job.priority.rank(),
        job.created_at.timestamp_millis().max(0),
        job.seq,
        job.id
    )
}

fn pending_prefix(project_key: &str) -> String {
    format!("jobidx:pending:{}:", escape_segment(project_key))
}

/// Parse the status segment and trailing job id out of an index key.
fn parse_index_key(key: &str) -> Option<(JobStatus, Uuid)> {
    let mut parts = key.splitn(3, ':');
    if parts.next() != Some("jobidx") {
        return None;
    }
    let status = match parts.next()? {
        "pending" => JobStatus::Pending,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        _ => return None,
    };
    let id = key.rsplit(':').next().and_then(|s| Uuid::parse_str(s).ok())?;
    Some((status, id))
}

impl JobStore {
    /// Create a store over the given backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Create a job in `Pending` and make it discoverable under the pending
    /// index. Safe to interleave with a concurrent `pop` on the same project:
    /// the record is written before the index entry, so the entry is never
    /// observed without its record.
    pub async fn push(
        &self,
        project_key: &str,
        payload: JobPayload,
        priority: JobPriority,
        category: JobCategory,
    ) -> Result<Job, QueueError> {
        let job = Job::new(project_key, payload, priority, category);
        self.kv
            .put(&record_key(job.id), &serialize(&job)?)
            .await
            .map_err(QueueError::Store)?;
        self.kv
            .put(&index_key(&job, JobStatus::Pending), &job.id.to_string())
            .await
            .map_err(QueueError::Store)?;

        debug!(job_id = %job.id, project = %job.project_key, priority = ?job.priority, "Job enqueued");
        Ok(job)
    }

    /// Atomically claim the first eligible pending job for a project and
    /// transition it to `Running`, stamping `started_at`.
    ///
    /// Stale index entries (record gone, or record status disagrees) are
    /// deleted and skipped rather than surfaced.
    pub async fn pop(&self, project_key: &str) -> Result<Option<Job>, QueueError> {
        let entries = self
            .kv
            .list(&pending_prefix(project_key))
            .await
            .map_err(QueueError::Store)?;

        for (key, value) in entries {
            let Ok(id) = Uuid::parse_str(&value) else {
                warn!(index_key = %key, "Dropping unparseable index entry");
                self.kv.delete(&key).await.map_err(QueueError::Store)?;
                continue;
            };

            let Some(job) = self.get(id).await? else {
                warn!(job_id = %id, "Dropping index entry for missing record");
                self.kv.delete(&key).await.map_err(QueueError::Store)?;
                continue;
            };

            if job.status != JobStatus::Pending {
                warn!(job_id = %id, status = %job.status, "Dropping stale pending index entry");
                self.kv.delete(&key).await.map_err(QueueError::Store)?;
                continue;
            }

            let claimed = self.transition(&job, JobStatus::Running, None).await?;
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    /// The atomic transition primitive.
    ///
    /// Builds the complete new record, swaps it in at `job:{id}`, writes the
    /// new index entry, then deletes the old one. `Running -> Pending` is the
    /// recovery edge: it boosts priority, clears `started_at`, and marks the
    /// job recovered.
    pub async fn transition(
        &self,
        job: &Job,
        new_status: JobStatus,
        failure_reason: Option<String>,
    ) -> Result<Job, QueueError> {
        if !job.status.can_transition_to(new_status) {
            return Err(QueueError::InvalidTransition {
                id: job.id,
                from: job.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let old_index = index_key(job, job.status);

        let mut next = job.clone();
        next.status = new_status;
        match new_status {
            JobStatus::Running => {
                next.started_at = Some(Utc::now());
            }
            JobStatus::Pending => {
                // Recovery: surface promptly, but keep created_at so relative
                // order among recovered jobs is preserved.
                next.priority = JobPriority::High;
                next.started_at = None;
                next.recovered = true;
            }
            JobStatus::Completed | JobStatus::Failed => {
                next.completed_at = Some(Utc::now());
                next.failure_reason = failure_reason;
            }
        }

        self.kv
            .put(&record_key(next.id), &serialize(&next)?)
            .await
            .map_err(QueueError::Store)?;
        self.kv
            .put(&index_key(&next, new_status), &next.id.to_string())
            .await
            .map_err(QueueError::Store)?;
        self.kv.delete(&old_index).await.map_err(QueueError::Store)?;

        debug!(job_id = %next.id, from = %job.status, to = %new_status, "Job transitioned");
        Ok(next)
    }

    /// Whether any pending index entry exists for the project.
    pub async fn has_pending(&self, project_key: &str) -> Result<bool, QueueError> {
        let entries = self
            .kv
            .list(&pending_prefix(project_key))
            .await
            .map_err(QueueError::Store)?;
        Ok(!entries.is_empty())
    }

    /// Get a job record by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        match self.kv.get(&record_key(id)).await.map_err(QueueError::Store)? {
            Some(raw) => Ok(Some(deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// List jobs currently under a status partition, skipping stale entries.
    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, QueueError> {
        let prefix = format!("jobidx:{status}:");
        let entries = self.kv.list(&prefix).await.map_err(QueueError::Store)?;

        let mut jobs = Vec::new();
        for (_, value) in entries {
            let Ok(id) = Uuid::parse_str(&value) else { continue };
            if let Some(job) = self.get(id).await? {
                if job.status == status {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    /// List every stored job record.
    pub async fn list_all(&self) -> Result<Vec<Job>, QueueError> {
        let entries = self.kv.list("job:").await.map_err(QueueError::Store)?;
        let mut jobs = Vec::new();
        for (_, raw) in entries {
            jobs.push(deserialize(&raw)?);
        }
        Ok(jobs)
    }

    /// Repair records and index entries left inconsistent by a crash
    /// mid-transition. Returns the number of jobs re-materialized as pending.
    ///
    /// Two passes, both idempotent:
    /// 1. delete index entries whose record is missing or disagrees on status;
    /// 2. rebuild index membership for any record that has none — non-terminal
    ///    records come back as `Pending` with boosted priority, terminal
    ///    records just get their terminal index entry rewritten.
    pub async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let index_entries = self.kv.list("jobidx:").await.map_err(QueueError::Store)?;
        let records = self.list_all().await?;
        let by_id: HashMap<Uuid, &Job> = records.iter().map(|j| (j.id, j)).collect();

        // Pass 1: drop stale index entries, remember which ids keep a valid one.
        let mut indexed: HashMap<Uuid, JobStatus> = HashMap::new();
        for (key, _) in &index_entries {
            let Some((idx_status, id)) = parse_index_key(key) else {
                warn!(index_key = %key, "Dropping unparseable index entry");
                self.kv.delete(key).await.map_err(QueueError::Store)?;
                continue;
            };
            match by_id.get(&id) {
                Some(job) if job.status == idx_status => {
                    indexed.insert(id, idx_status);
                }
                Some(job) => {
                    warn!(job_id = %id, index_status = %idx_status, record_status = %job.status,
                        "Dropping index entry that disagrees with record");
                    self.kv.delete(key).await.map_err(QueueError::Store)?;
                }
                None => {
                    warn!(job_id = %id, "Dropping index entry for missing record");
                    self.kv.delete(key).await.map_err(QueueError::Store)?;
                }
            }
        }

        // Pass 2: every record must be discoverable under exactly its status.
        let mut recovered = 0;
        for job in &records {
            if indexed.contains_key(&job.id) {
                continue;
            }
            if job.status.is_terminal() {
                self.kv
                    .put(&index_key(job, job.status), &job.id.to_string())
                    .await
                    .map_err(QueueError::Store)?;
                debug!(job_id = %job.id, status = %job.status, "Rewrote missing terminal index entry");
                continue;
            }

            let mut next = (*job).clone();
            next.status = JobStatus::Pending;
            next.priority = JobPriority::High;
            next.started_at = None;
            next.recovered = true;

            self.kv
                .put(&record_key(next.id), &serialize(&next)?)
                .await
                .map_err(QueueError::Store)?;
            self.kv
                .put(&index_key(&next, JobStatus::Pending), &next.id.to_string())
                .await
                .map_err(QueueError::Store)?;

            info!(job_id = %next.id, was = %job.status, now = %next.status,
                "Recovered orphaned job to pending with boosted priority");
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Force one `Running` job back to `Pending` with boosted priority,
    /// through the same atomic primitive a worker's crash recovery uses.
    pub async fn recover_job(&self, id: Uuid) -> Result<Job, QueueError> {
        let job = self.get(id).await?.ok_or(QueueError::NotFound { id })?;
        let before = job.status;
        let recovered = self.transition(&job, JobStatus::Pending, None).await?;
        info!(job_id = %id, before = %before, after = %recovered.status, "Force-recovered job");
        Ok(recovered)
    }
}

fn serialize(job: &Job) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Store(e.into()))
}

fn deserialize(raw: &str) -> Result<Job, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Store(e.into()))
}
