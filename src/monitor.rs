//! Health monitor — out-of-band detection and recovery of stuck work.
//!
//! Runs on a fixed interval, independent of the execution path; it only
//! touches the registry through brief reads and `ensure_worker`. A `running`
//! job is recovered only when both
//! hold: no live worker task owns its project, and `started_at` is past the
//! timeout floor for the job's category. A live worker will have moved its
//! job to a terminal state long before the threshold, so the monitor and a
//! worker are never both valid writers for the same job.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Error;
use crate::queue::{JobCategory, JobStatus, JobStore, WorkerRegistry, WorkerSupervisor};
use crate::session::{SessionStatus, SessionTracker, SteeringChannel};

/// Periodic recovery scanner.
#[derive(Clone)]
pub struct HealthMonitor {
    store: JobStore,
    registry: Arc<WorkerRegistry>,
    sessions: SessionTracker,
    steering: SteeringChannel,
    config: EngineConfig,
    supervisor: Option<WorkerSupervisor>,
}

impl HealthMonitor {
    pub fn new(
        store: JobStore,
        registry: Arc<WorkerRegistry>,
        sessions: SessionTracker,
        steering: SteeringChannel,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            sessions,
            steering,
            config,
            supervisor: None,
        }
    }

    /// Wire the supervisor so sweeps can respawn workers for pending work
    /// that has no live owner (recovered jobs included).
    pub fn with_supervisor(mut self, supervisor: WorkerSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Startup repair: re-materialize orphans left by a crash mid-transition
    /// (record exists, index membership missing or stale).
    pub async fn startup_pass(&self) -> Result<usize, Error> {
        let recovered = self.store.recover_orphans().await?;
        if recovered > 0 {
            info!(count = recovered, "Startup pass recovered orphaned jobs");
        }
        Ok(recovered)
    }

    /// Spawn the periodic sweep loop. First tick fires immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.monitor_interval, "Health monitor started");
            let mut tick = tokio::time::interval(self.config.monitor_interval);
            loop {
                tick.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!(error = %e, "Health monitor sweep failed");
                }
            }
        })
    }

    /// One sweep: recover timed-out running jobs with dead owners, then reap
    /// sessions left active by the same failure. Returns jobs recovered.
    pub async fn sweep(&self) -> Result<usize, Error> {
        // Orphan repair is cheap and idempotent; keeping it in the sweep
        // means a crash between sweeps is healed without a restart.
        self.store.recover_orphans().await?;

        let now = Utc::now();
        let mut recovered = 0;

        for job in self.store.list_by_status(JobStatus::Running).await? {
            if self.registry.is_alive(&job.project_key).await {
                continue;
            }
            let Some(started_at) = job.started_at else {
                // Running without started_at only happens mid-crash; the
                // orphan pass above rebuilds it next time around.
                continue;
            };

            let timeout = match job.category {
                JobCategory::Standard => self.config.timeout_standard,
                JobCategory::LongRunning => self.config.timeout_long_running,
            };
            let age = (now - started_at).to_std().unwrap_or_default();
            if age < timeout {
                debug!(job_id = %job.id, age = ?age, "Running job has no live worker but is within its timeout window");
                continue;
            }

            warn!(
                job_id = %job.id,
                project = %job.project_key,
                age = ?age,
                category = ?job.category,
                "Recovering stuck running job"
            );
            let after = self.store.recover_job(job.id).await?;
            info!(job_id = %after.id, before = %JobStatus::Running, after = %after.status, "Stuck job recovered");
            recovered += 1;
        }

        self.reap_stale_sessions(now).await?;
        self.ensure_pending_workers().await?;
        Ok(recovered)
    }

    /// Respawn workers for any project holding pending jobs with no live
    /// worker. Covers jobs recovered by this sweep and pushes that raced a
    /// worker's exit.
    async fn ensure_pending_workers(&self) -> Result<(), Error> {
        let Some(supervisor) = &self.supervisor else {
            return Ok(());
        };

        let mut projects: Vec<String> = self
            .store
            .list_by_status(JobStatus::Pending)
            .await?
            .into_iter()
            .map(|j| j.project_key)
            .collect();
        projects.sort();
        projects.dedup();

        for project in projects {
            if !self.registry.is_alive(&project).await {
                info!(project = %project, "Respawning worker for stranded pending work");
                supervisor.ensure_worker(&project).await;
            }
        }
        Ok(())
    }

    /// Force-recover every running job with no live owner, ignoring the
    /// timeout floor. Ops surface only.
    pub async fn force_recover_all(&self) -> Result<usize, Error> {
        let mut recovered = 0;
        for job in self.store.list_by_status(JobStatus::Running).await? {
            if self.registry.is_alive(&job.project_key).await {
                continue;
            }
            self.store.recover_job(job.id).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Fail sessions stuck active past the standard timeout with no live
    /// worker, clearing their mailboxes.
    async fn reap_stale_sessions(&self, now: chrono::DateTime<Utc>) -> Result<(), Error> {
        for session in self.sessions.list_active().await? {
            if self.registry.is_alive(&session.project_key).await {
                continue;
            }
            let idle = (now - session.last_activity).to_std().unwrap_or_default();
            if idle < self.config.timeout_standard {
                continue;
            }
            warn!(session_id = %session.session_id, idle = ?idle, "Reaping stale active session");
            self.sessions
                .finalize(session.session_id, SessionStatus::Failed)
                .await?;
            self.steering.clear(session.session_id).await?;
        }
        Ok(())
    }
}
