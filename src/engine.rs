//! Engine composition — wires the queue, sessions, steering, gate, and the
//! external collaborator seams together behind the public enqueue/inbound API.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::Classifier;
use crate::config::EngineConfig;
use crate::deliver::Delivery;
use crate::error::{Error, ExecutionError};
use crate::gate::{AutoContinueGate, GateDecision};
use crate::monitor::HealthMonitor;
use crate::plan::PlanLookup;
use crate::queue::{
    Job, JobCategory, JobPayload, JobPriority, JobProcessor, JobStatus, JobStore, WorkerRegistry,
    WorkerSupervisor,
};
use crate::runner::{AgentRunner, ExecutionContext};
use crate::session::{Session, SessionStatus, SessionTracker, SteeringChannel};
use crate::store::KvStore;

/// External collaborators the engine consumes through trait seams.
#[derive(Clone)]
pub struct EngineDeps {
    pub runner: Arc<dyn AgentRunner>,
    pub classifier: Arc<dyn Classifier>,
    pub delivery: Arc<dyn Delivery>,
    pub plans: Arc<dyn PlanLookup>,
}

/// Where an inbound human message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRouting {
    /// Injected into an in-flight session's steering mailbox.
    Steered { session_id: Uuid, is_abort: bool },
    /// No active session; a fresh job was enqueued.
    Enqueued { job_id: Uuid },
}

/// Processes claimed jobs: run with checkpoints, classify, gate, act.
///
/// Split from [`Engine`] so the supervisor can hold it without a reference
/// cycle; continuations pushed here are picked up by the already-live worker,
/// so the processor never needs the supervisor back.
struct Processor {
    store: JobStore,
    sessions: SessionTracker,
    steering: SteeringChannel,
    gate: AutoContinueGate,
    deps: EngineDeps,
}

impl Processor {
    /// Bind the session for a job: continuations reuse the session they
    /// carry; fresh jobs open a new one (superseding any stale active slot).
    async fn bind_session(&self, job: &Job) -> Result<Session, Error> {
        if let Some(session_id) = job.payload.session_id {
            match self.sessions.get(session_id).await? {
                Some(session) if session.status == SessionStatus::Active => return Ok(session),
                _ => {
                    warn!(job_id = %job.id, session_id = %session_id,
                        "Continuation session no longer active; opening a fresh one");
                }
            }
        }
        Ok(self
            .sessions
            .begin(&job.project_key, &job.payload.conversation, &job.payload.sender)
            .await?)
    }

    async fn deliver(&self, session_id: Uuid, text: &str) {
        if let Err(e) = self.deps.delivery.deliver(session_id, text).await {
            warn!(session_id = %session_id, error = %e, "Delivery failed");
        }
    }

    /// Finalize the session and clear its mailbox so a reused identifier
    /// never inherits stale instructions.
    async fn close_session(&self, session_id: Uuid, status: SessionStatus) -> Result<(), Error> {
        self.sessions.finalize(session_id, status).await?;
        self.steering.clear(session_id).await?;
        Ok(())
    }

    /// Re-enqueue a continuation of the same request, coaching attached.
    async fn enqueue_continuation(
        &self,
        job: &Job,
        session: &Session,
        coaching: Option<String>,
    ) -> Result<(), Error> {
        let coaching = match coaching {
            Some(note) => Some(note),
            None => match &job.payload.workflow {
                Some(workflow) => self.deps.plans.coaching_for(workflow).await,
                None => None,
            },
        };

        let count = self
            .sessions
            .increment_auto_continue(session.session_id)
            .await?;
        let payload = job.payload.continuation(session.session_id, coaching);
        let continuation = self
            .store
            .push(&job.project_key, payload, job.priority, job.category)
            .await?;

        info!(
            job_id = %job.id,
            continuation_id = %continuation.id,
            session_id = %session.session_id,
            auto_continue_count = count,
            "Silently re-enqueued continuation"
        );
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for Processor {
    async fn process(&self, job: Job) -> Result<(), Error> {
        let session = self.bind_session(&job).await?;
        self.sessions.touch(session.session_id).await?;

        let mut input = job.payload.request.clone();
        if let Some(coaching) = &job.payload.coaching {
            input.push_str("\n\nCoaching note: ");
            input.push_str(coaching);
        }

        let ctx = ExecutionContext::new(
            session.session_id,
            self.steering.clone(),
            self.sessions.clone(),
            input,
        );

        let output = match self.deps.runner.run(&job, &ctx).await {
            Ok(output) => output,
            Err(ExecutionError::Aborted) => {
                self.close_session(session.session_id, SessionStatus::Failed).await?;
                self.deliver(session.session_id, "Work aborted as requested.").await;
                return Err(ExecutionError::Aborted.into());
            }
            Err(e) => {
                self.close_session(session.session_id, SessionStatus::Failed).await?;
                self.deliver(session.session_id, &format!("Work failed: {e}")).await;
                return Err(e.into());
            }
        };

        // Classifier trouble degrades to the conservative pause path.
        let verdict = match self.deps.classifier.classify(&output).await {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e,
                    "Classifier unavailable; treating output as a question");
                None
            }
        };

        // Re-read: a human message during execution resets the continuation
        // counter, and the gate must see that.
        let session = self
            .sessions
            .get(session.session_id)
            .await?
            .unwrap_or(session);

        match self.gate.decide(verdict.as_ref(), &session) {
            GateDecision::Finalize { status } => {
                self.deliver(session.session_id, &output).await;
                self.close_session(session.session_id, status).await?;
            }
            GateDecision::DeliverAndWait => {
                self.deliver(session.session_id, &output).await;
                self.close_session(session.session_id, SessionStatus::Dormant).await?;
            }
            GateDecision::Continue { coaching } => {
                self.enqueue_continuation(&job, &session, coaching).await?;
            }
        }

        Ok(())
    }
}

/// The queue engine: public API over enqueue, inbound routing, and recovery.
pub struct Engine {
    config: EngineConfig,
    store: JobStore,
    sessions: SessionTracker,
    steering: SteeringChannel,
    registry: Arc<WorkerRegistry>,
    supervisor: WorkerSupervisor,
    monitor: HealthMonitor,
}

impl Engine {
    /// Wire an engine over a backend and collaborator set.
    pub fn new(kv: Arc<dyn KvStore>, config: EngineConfig, deps: EngineDeps) -> Self {
        let store = JobStore::new(kv.clone());
        let sessions = SessionTracker::new(kv.clone());
        let steering = SteeringChannel::new(kv, config.steering_ttl);
        let registry = Arc::new(WorkerRegistry::new());

        let processor = Arc::new(Processor {
            store: store.clone(),
            sessions: sessions.clone(),
            steering: steering.clone(),
            gate: AutoContinueGate::new(&config),
            deps,
        });

        let supervisor = WorkerSupervisor::new(
            store.clone(),
            registry.clone(),
            processor,
            config.clone(),
        );
        let monitor = HealthMonitor::new(
            store.clone(),
            registry.clone(),
            sessions.clone(),
            steering.clone(),
            config.clone(),
        )
        .with_supervisor(supervisor.clone());

        Self {
            config,
            store,
            sessions,
            steering,
            registry,
            supervisor,
            monitor,
        }
    }

    /// Startup: repair orphans, then resume workers for any project that
    /// still has pending work.
    pub async fn startup(&self) -> Result<(), Error> {
        self.monitor.startup_pass().await?;

        let pending = self.store.list_by_status(JobStatus::Pending).await?;
        let mut projects: Vec<String> = pending.into_iter().map(|j| j.project_key).collect();
        projects.sort();
        projects.dedup();
        for project in projects {
            self.supervisor.ensure_worker(&project).await;
        }
        Ok(())
    }

    /// Spawn the periodic health monitor.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        self.monitor.clone().spawn()
    }

    /// Enqueue a unit of work and make sure a worker exists for its project.
    pub async fn enqueue(
        &self,
        project_key: &str,
        request: &str,
        conversation: &str,
        sender: &str,
        priority: JobPriority,
        category: JobCategory,
    ) -> Result<Uuid, Error> {
        let job = self
            .store
            .push(
                project_key,
                JobPayload::new(request, conversation, sender),
                priority,
                category,
            )
            .await?;
        self.supervisor.ensure_worker(project_key).await;
        Ok(job.id)
    }

    /// Route an inbound human message: steering when the slot's session is
    /// still in flight, a fresh job otherwise. Human input always resets the
    /// auto-continue counter.
    pub async fn handle_inbound(
        &self,
        project_key: &str,
        conversation: &str,
        sender: &str,
        text: &str,
    ) -> Result<InboundRouting, Error> {
        if let Some(session) = self.sessions.active_for(project_key, conversation).await? {
            self.sessions.reset_auto_continue(session.session_id).await?;
            let is_abort = is_abort_text(text);
            self.steering
                .push(session.session_id, text, sender, is_abort)
                .await?;
            return Ok(InboundRouting::Steered {
                session_id: session.session_id,
                is_abort,
            });
        }

        let job_id = self
            .enqueue(
                project_key,
                text,
                conversation,
                sender,
                JobPriority::Normal,
                JobCategory::Standard,
            )
            .await?;
        Ok(InboundRouting::Enqueued { job_id })
    }

    /// Shutdown: stop workers, then mark every session this process owns
    /// that is still active as failed.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.registry.abort_all().await;
        self.sessions.fail_all_active().await?;
        info!("Engine shut down");
        Ok(())
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Whether an inbound text is an abort command.
fn is_abort_text(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "abort" | "stop" | "cancel"
    )
}
