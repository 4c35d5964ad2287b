//! Per-project worker supervision.
//!
//! Guarantees exactly one active worker loop per `project_key`. The worker
//! drains the project's queue sequentially; two jobs from the same project
//! never run concurrently. Different projects execute fully independently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, ExecutionError};
use crate::queue::job::{Job, JobStatus, ABORTED_REASON};
use crate::queue::store::JobStore;

/// Processes one claimed job to completion.
///
/// The engine implements this; keeping it a trait keeps the supervisor free of
/// session/classifier/delivery concerns.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: Job) -> Result<(), Error>;
}

/// Registry of live worker tasks, keyed by project.
///
/// An explicit object with init-at-startup and teardown-at-shutdown, passed by
/// `Arc` — never ambient module state. The Health Monitor reads it to judge
/// whether a `running` job still has a live owner.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live worker task is registered for the project.
    pub async fn is_alive(&self, project_key: &str) -> bool {
        let workers = self.workers.read().await;
        workers
            .get(project_key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Remove a project's registration. Called by the worker itself on exit.
    pub async fn deregister(&self, project_key: &str) {
        self.workers.write().await.remove(project_key);
    }

    /// Register a task as the worker for a project. The supervisor does this
    /// under its own lock; exposed for tests that fake a live worker.
    pub(crate) async fn register(&self, project_key: &str, handle: JoinHandle<()>) {
        self.workers.write().await.insert(project_key.to_string(), handle);
    }

    /// Abort all worker tasks. Shutdown path only.
    pub async fn abort_all(&self) {
        let mut workers = self.workers.write().await;
        for (project, handle) in workers.drain() {
            if !handle.is_finished() {
                debug!(project = %project, "Aborting worker task");
                handle.abort();
            }
        }
    }

    /// Number of live workers.
    pub async fn live_count(&self) -> usize {
        let workers = self.workers.read().await;
        workers.values().filter(|h| !h.is_finished()).count()
    }
}

/// Ensures one worker loop per project and owns the loop itself.
#[derive(Clone)]
pub struct WorkerSupervisor {
    store: JobStore,
    registry: Arc<WorkerRegistry>,
    processor: Arc<dyn JobProcessor>,
    config: EngineConfig,
}

impl WorkerSupervisor {
    pub fn new(
        store: JobStore,
        registry: Arc<WorkerRegistry>,
        processor: Arc<dyn JobProcessor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            processor,
            config,
        }
    }

    /// Idempotently make sure a worker loop exists for the project.
    ///
    /// A live worker means newly pushed jobs will be picked up by its next
    /// pop, so this is a no-op in that case. The check-and-spawn happens under
    /// the registry write lock, so two racing calls cannot both spawn.
    // Returns a boxed future (rather than being an `async fn`) because the
    // worker loop calls back into it, and the compiler cannot prove `Send`
    // for mutually recursive opaque futures.
    pub fn ensure_worker<'a>(
        &'a self,
        project_key: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut workers = self.registry.workers.write().await;

            if let Some(handle) = workers.get(project_key) {
                if !handle.is_finished() {
                    return;
                }
            }

            let supervisor = self.clone();
            let key = project_key.to_string();
            let handle = tokio::spawn(async move {
                supervisor.worker_loop(&key).await;
            });
            workers.insert(project_key.to_string(), handle);
            info!(project = %project_key, "Worker spawned");
        })
    }

    /// Sequential drain loop for one project.
    ///
    /// Exits only after two consecutive empty reads separated by the
    /// drain-guard yield, so a push racing the last pop is still processed
    /// before the worker deregisters.
    async fn worker_loop(&self, project_key: &str) {
        let mut empty_reads = 0u8;
        let mut errored = false;

        loop {
            let job = match self.store.pop(project_key).await {
                Ok(job) => job,
                Err(e) => {
                    error!(project = %project_key, error = %e, "Pop failed; worker exiting");
                    errored = true;
                    break;
                }
            };

            let Some(job) = job else {
                empty_reads += 1;
                if empty_reads >= 2 {
                    break;
                }
                tokio::time::sleep(self.config.drain_guard_yield).await;
                continue;
            };

            empty_reads = 0;
            self.run_one(job).await;
        }

        self.registry.deregister(project_key).await;
        debug!(project = %project_key, "Worker exited after drain guard");

        // A push after the final empty read may have seen this task still
        // live and skipped its own spawn. Re-check now that deregistration
        // is visible, so that job is not stranded.
        if !errored {
            match self.store.has_pending(project_key).await {
                Ok(true) => self.ensure_worker(project_key).await,
                Ok(false) => {}
                Err(e) => {
                    error!(project = %project_key, error = %e, "Pending re-check failed after worker exit");
                }
            }
        }
    }

    /// Execute one claimed job and record its terminal status.
    ///
    /// A processing failure terminates only this job; the loop proceeds to
    /// the next one.
    async fn run_one(&self, job: Job) {
        let job_id = job.id;
        let project = job.project_key.clone();
        info!(job_id = %job_id, project = %project, "Job execution starting");

        let outcome = self.processor.process(job.clone()).await;

        // Re-read: the processor (or the Health Monitor, if we stalled past
        // its threshold) may have already moved the job.
        let current = match self.store.get(job_id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(job_id = %job_id, "Job record vanished during execution");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to re-read job after execution");
                return;
            }
        };
        if current.status != JobStatus::Running {
            debug!(job_id = %job_id, status = %current.status, "Job already moved; skipping terminal write");
            return;
        }

        let result = match outcome {
            Ok(()) => {
                self.store
                    .transition(&current, JobStatus::Completed, None)
                    .await
            }
            Err(Error::Execution(ExecutionError::Aborted)) => {
                info!(job_id = %job_id, "Job aborted by steering message");
                self.store
                    .transition(&current, JobStatus::Failed, Some(ABORTED_REASON.to_string()))
                    .await
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job failed");
                self.store
                    .transition(&current, JobStatus::Failed, Some(e.to_string()))
                    .await
            }
        };

        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "Failed to record job terminal status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{JobCategory, JobPayload, JobPriority};
    use crate::store::MemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Processor that records execution order and can fail on request.
    struct ScriptedProcessor {
        seen: tokio::sync::Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn new() -> Self {
            Self {
                seen: tokio::sync::Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobProcessor for ScriptedProcessor {
        async fn process(&self, job: Job) -> Result<(), Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.seen.lock().await.push(job.payload.request.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if job.payload.request.starts_with("fail") {
                return Err(Error::Execution(ExecutionError::Failed {
                    reason: "scripted".into(),
                }));
            }
            if job.payload.request.starts_with("abort") {
                return Err(Error::Execution(ExecutionError::Aborted));
            }
            Ok(())
        }
    }

    fn setup(processor: Arc<ScriptedProcessor>) -> (JobStore, WorkerSupervisor) {
        let store = JobStore::new(Arc::new(MemoryKv::new()));
        let registry = Arc::new(WorkerRegistry::new());
        let config = EngineConfig {
            drain_guard_yield: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let supervisor = WorkerSupervisor::new(store.clone(), registry, processor, config);
        (store, supervisor)
    }

    async fn push(store: &JobStore, project: &str, req: &str) -> Job {
        store
            .push(
                project,
                JobPayload::new(req, "conv", "alice"),
                JobPriority::Normal,
                JobCategory::Standard,
            )
            .await
            .unwrap()
    }

    async fn wait_for_drain(supervisor: &WorkerSupervisor) {
        for _ in 0..100 {
            if supervisor.registry.live_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workers did not drain");
    }

    #[tokio::test]
    async fn drains_sequentially_and_none_lost() {
        let processor = Arc::new(ScriptedProcessor::new());
        let (store, supervisor) = setup(processor.clone());

        push(&store, "p1", "a").await;
        supervisor.ensure_worker("p1").await;
        // Pushed while the worker is busy with "a" — drain guard must catch them.
        push(&store, "p1", "b").await;
        push(&store, "p1", "c").await;

        wait_for_drain(&supervisor).await;

        let seen = processor.seen.lock().await.clone();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);

        for job in store.list_all().await.unwrap() {
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn ensure_worker_is_idempotent() {
        let processor = Arc::new(ScriptedProcessor::new());
        let (store, supervisor) = setup(processor.clone());

        push(&store, "p1", "a").await;
        supervisor.ensure_worker("p1").await;
        supervisor.ensure_worker("p1").await;
        supervisor.ensure_worker("p1").await;
        assert_eq!(supervisor.registry.live_count().await, 1);

        wait_for_drain(&supervisor).await;
        let seen = processor.seen.lock().await.clone();
        assert_eq!(seen.len(), 1, "job must run exactly once");
    }

    #[tokio::test]
    async fn failure_terminates_only_the_current_job() {
        let processor = Arc::new(ScriptedProcessor::new());
        let (store, supervisor) = setup(processor.clone());

        let failing = push(&store, "p1", "fail-1").await;
        let ok = push(&store, "p1", "ok-2").await;
        supervisor.ensure_worker("p1").await;
        wait_for_drain(&supervisor).await;

        let failed = store.get(failing.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        let completed = store.get(ok.id).await.unwrap().unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn abort_maps_to_aborted_failure_reason() {
        let processor = Arc::new(ScriptedProcessor::new());
        let (store, supervisor) = setup(processor.clone());

        let job = push(&store, "p1", "abort-now").await;
        supervisor.ensure_worker("p1").await;
        wait_for_drain(&supervisor).await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert!(stored.is_aborted());
    }

    #[tokio::test]
    async fn projects_run_independently() {
        let processor = Arc::new(ScriptedProcessor::new());
        let (store, supervisor) = setup(processor.clone());

        push(&store, "p1", "a1").await;
        push(&store, "p2", "b1").await;
        supervisor.ensure_worker("p1").await;
        supervisor.ensure_worker("p2").await;
        assert_eq!(supervisor.registry.live_count().await, 2);

        wait_for_drain(&supervisor).await;
        let mut seen = processor.seen.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec!["a1", "b1"]);
    }

    #[tokio::test]
    async fn at_most_one_running_per_project() {
        let processor = Arc::new(ScriptedProcessor::new());
        let (store, supervisor) = setup(processor.clone());

        for i in 0..5 {
            push(&store, "p1", &format!("job-{i}")).await;
        }
        supervisor.ensure_worker("p1").await;
        wait_for_drain(&supervisor).await;

        // Sequential execution: never more than one in flight.
        assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
