//! End-to-end scenarios over the full engine with scripted collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use steerqueue::classify::{ClassificationResult, Classifier, OutputType};
use steerqueue::config::EngineConfig;
use steerqueue::deliver::Delivery;
use steerqueue::engine::{Engine, EngineDeps, InboundRouting};
use steerqueue::error::{ClassifierError, DeliveryError, ExecutionError};
use steerqueue::plan::StaticPlanLookup;
use steerqueue::queue::{Job, JobCategory, JobPayload, JobPriority, JobStatus, JobStore};
use steerqueue::runner::{AgentRunner, CheckpointSignal, ExecutionContext};
use steerqueue::session::SessionStatus;
use steerqueue::store::{KvStore, MemoryKv};

/// Runner driven by the request text.
///
/// Requests starting with `hold` poll checkpoints until steering arrives, so a
/// test can inject mid-flight. Requests starting with `crash` fail hard.
/// Everything else takes one checkpoint and finishes.
struct ScriptedRunner {
    seen: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, job: &Job, ctx: &ExecutionContext) -> Result<String, ExecutionError> {
        self.seen.lock().await.push(job.payload.request.clone());

        if job.payload.request.starts_with("crash") {
            return Err(ExecutionError::Failed {
                reason: "scripted crash".into(),
            });
        }

        if job.payload.request.starts_with("hold") {
            for _ in 0..500 {
                match ctx.checkpoint().await? {
                    CheckpointSignal::Abort => return Err(ExecutionError::Aborted),
                    CheckpointSignal::Inject(extra) => {
                        ctx.record_tool_call().await.map_err(|e| {
                            ExecutionError::Failed { reason: e.to_string() }
                        })?;
                        return Ok(format!("Done, applied: {extra}. All tests pass."));
                    }
                    CheckpointSignal::Proceed => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }
            return Ok("Done waiting. All tests pass.".into());
        }

        match ctx.checkpoint().await? {
            CheckpointSignal::Abort => Err(ExecutionError::Aborted),
            _ => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(format!("Finished: {}. All tests pass.", ctx.input()))
            }
        }
    }
}

/// Classifier that consumes a scripted verdict queue, falling back to an
/// evidenced completion when the script runs out.
struct ScriptedClassifier {
    script: Mutex<VecDeque<ClassificationResult>>,
    unavailable: AtomicBool,
}

impl ScriptedClassifier {
    fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    async fn script(&self, verdicts: Vec<ClassificationResult>) {
        self.script.lock().await.extend(verdicts);
    }

    fn set_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _raw_output: &str) -> Result<ClassificationResult, ClassifierError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClassifierError::Unavailable("scripted outage".into()));
        }
        Ok(self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| verdict(OutputType::Completion, 0.9, true)))
    }
}

fn verdict(output_type: OutputType, confidence: f32, evidence: bool) -> ClassificationResult {
    ClassificationResult {
        output_type,
        confidence,
        evidence_present: evidence,
        reason: "scripted".into(),
    }
}

/// Records every delivered message.
struct RecordingDelivery {
    messages: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingDelivery {
    fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    async fn texts(&self) -> Vec<String> {
        self.messages.lock().await.iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, session_id: Uuid, text: &str) -> Result<(), DeliveryError> {
        self.messages.lock().await.push((session_id, text.to_string()));
        Ok(())
    }
}

struct Harness {
    kv: Arc<MemoryKv>,
    engine: Engine,
    runner: Arc<ScriptedRunner>,
    classifier: Arc<ScriptedClassifier>,
    delivery: Arc<RecordingDelivery>,
}

fn harness() -> Harness {
    harness_on(Arc::new(MemoryKv::new()))
}

fn harness_on(kv: Arc<MemoryKv>) -> Harness {
    let runner = Arc::new(ScriptedRunner::new());
    let classifier = Arc::new(ScriptedClassifier::new());
    let delivery = Arc::new(RecordingDelivery::new());
    let deps = EngineDeps {
        runner: runner.clone(),
        classifier: classifier.clone(),
        delivery: delivery.clone(),
        plans: Arc::new(StaticPlanLookup::new()),
    };
    let config = EngineConfig {
        drain_guard_yield: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let engine = Engine::new(kv.clone() as Arc<dyn KvStore>, config, deps);
    Harness {
        kv,
        engine,
        runner,
        classifier,
        delivery,
    }
}

macro_rules! wait_until {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..500 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ok, "timed out waiting for: {}", stringify!($cond));
    }};
}

async fn all_terminal(engine: &Engine) -> bool {
    engine
        .store()
        .list_all()
        .await
        .unwrap()
        .iter()
        .all(|j| j.status.is_terminal())
}

#[tokio::test]
async fn restart_recovers_orphaned_work_and_finishes_it() {
    let kv = Arc::new(MemoryKv::new());

    // Pre-crash state, written by a process that died mid-transition: one job
    // claimed as running whose index entry never landed, one still pending.
    let store = JobStore::new(kv.clone() as Arc<dyn KvStore>);
    store
        .push(
            "p1",
            JobPayload::new("interrupted work", "conv", "alice"),
            JobPriority::Normal,
            JobCategory::Standard,
        )
        .await
        .unwrap();
    let stuck = store.pop("p1").await.unwrap().unwrap();
    for (key, _) in kv.list("jobidx:running:").await.unwrap() {
        kv.delete(&key).await.unwrap();
    }
    let queued = store
        .push(
            "p1",
            JobPayload::new("queued work", "conv", "alice"),
            JobPriority::Normal,
            JobCategory::Standard,
        )
        .await
        .unwrap();

    // New process over the same database.
    let h = harness_on(kv);
    h.engine.startup().await.unwrap();

    wait_until!(all_terminal(&h.engine).await);

    let recovered = h.engine.store().get(stuck.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::Completed);
    assert!(recovered.recovered);
    assert_eq!(
        h.engine.store().get(queued.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    // Recovered job was boosted ahead of the ordinary pending one.
    let seen = h.runner.seen.lock().await.clone();
    assert_eq!(seen, vec!["interrupted work", "queued work"]);
}

#[tokio::test]
async fn steering_reaches_the_runner_mid_flight() {
    let h = harness();
    let job_id = h
        .engine
        .enqueue("p1", "hold for input", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(h.engine.sessions().active_for("p1", "conv").await.unwrap().is_some());

    let routing = h
        .engine
        .handle_inbound("p1", "conv", "alice", "use the blue theme")
        .await
        .unwrap();
    assert!(matches!(routing, InboundRouting::Steered { is_abort: false, .. }));

    wait_until!(all_terminal(&h.engine).await);

    let job = h.engine.store().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    // The injected text made it into the delivered output, and the steered
    // message did not spawn a second job.
    let texts = h.delivery.texts().await;
    assert!(texts.iter().any(|t| t.contains("use the blue theme")), "{texts:?}");
    assert_eq!(h.engine.store().list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn abort_fails_the_job_and_clears_everything() {
    let h = harness();
    let job_id = h
        .engine
        .enqueue("p1", "hold for input", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(h.engine.sessions().active_for("p1", "conv").await.unwrap().is_some());

    let routing = h.engine.handle_inbound("p1", "conv", "alice", "abort").await.unwrap();
    let InboundRouting::Steered { session_id, is_abort } = routing else {
        panic!("expected the abort to be routed as steering");
    };
    assert!(is_abort);

    wait_until!(all_terminal(&h.engine).await);

    let job = h.engine.store().get(job_id).await.unwrap().unwrap();
    assert!(job.is_aborted());

    // No continuation, session failed, mailbox gone.
    assert_eq!(h.engine.store().list_all().await.unwrap().len(), 1);
    let session = h.engine.sessions().get(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(h.kv.list("steer:").await.unwrap().is_empty());
}

#[tokio::test]
async fn status_updates_continue_silently_until_the_cap() {
    let h = harness();
    h.classifier
        .script(vec![
            verdict(OutputType::StatusUpdate, 0.9, false),
            verdict(OutputType::StatusUpdate, 0.9, false),
            verdict(OutputType::StatusUpdate, 0.9, false),
            verdict(OutputType::StatusUpdate, 0.9, false),
        ])
        .await;

    h.engine
        .enqueue("p1", "long refactor", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    // Original job plus exactly three silent continuations.
    wait_until!(
        h.engine.store().list_all().await.unwrap().len() == 4 && all_terminal(&h.engine).await
    );

    for job in h.engine.store().list_all().await.unwrap() {
        assert_eq!(job.status, JobStatus::Completed);
    }

    // Only the capped round was delivered; the session paused dormant at
    // the cap.
    let messages = h.delivery.messages.lock().await.clone();
    assert_eq!(messages.len(), 1);
    let session = h.engine.sessions().get(messages[0].0).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Dormant);
    assert_eq!(session.auto_continue_count, 3);
}

#[tokio::test]
async fn evidenced_completion_finalizes_the_session() {
    let h = harness();
    h.engine
        .enqueue("p1", "small fix", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(all_terminal(&h.engine).await);

    let messages = h.delivery.messages.lock().await.clone();
    assert_eq!(messages.len(), 1);
    let session = h.engine.sessions().get(messages[0].0).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    // A later reply on the same conversation starts fresh work instead of
    // steering the finished session.
    let routing = h
        .engine
        .handle_inbound("p1", "conv", "alice", "one more thing")
        .await
        .unwrap();
    assert!(matches!(routing, InboundRouting::Enqueued { .. }));
}

#[tokio::test]
async fn error_verdict_delivers_and_fails_without_continuing() {
    let h = harness();
    h.classifier
        .script(vec![verdict(OutputType::Error, 0.9, true)])
        .await;

    h.engine
        .enqueue("p1", "risky change", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(all_terminal(&h.engine).await);

    // Delivered once, no silent retry, session failed.
    assert_eq!(h.engine.store().list_all().await.unwrap().len(), 1);
    let messages = h.delivery.messages.lock().await.clone();
    assert_eq!(messages.len(), 1);
    let session = h.engine.sessions().get(messages[0].0).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
}

#[tokio::test]
async fn runner_failure_fails_job_and_session() {
    let h = harness();
    let job_id = h
        .engine
        .enqueue("p1", "crash now", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(all_terminal(&h.engine).await);

    let job = h.engine.store().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(!job.is_aborted());

    let texts = h.delivery.texts().await;
    assert!(texts.iter().any(|t| t.contains("scripted crash")), "{texts:?}");
}

#[tokio::test]
async fn classifier_outage_pauses_instead_of_continuing() {
    let h = harness();
    h.classifier.set_unavailable();

    h.engine
        .enqueue("p1", "some work", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(all_terminal(&h.engine).await);

    // Output delivered verbatim, session dormant, no continuation job.
    assert_eq!(h.engine.store().list_all().await.unwrap().len(), 1);
    let messages = h.delivery.messages.lock().await.clone();
    assert_eq!(messages.len(), 1);
    let session = h.engine.sessions().get(messages[0].0).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Dormant);
}

#[tokio::test]
async fn projects_serialize_internally_but_run_independently() {
    let h = harness();
    for req in ["p1 first", "p1 second", "p1 third"] {
        h.engine
            .enqueue("p1", req, "conv-a", "alice", JobPriority::Normal, JobCategory::Standard)
            .await
            .unwrap();
    }
    for req in ["p2 first", "p2 second"] {
        h.engine
            .enqueue("p2", req, "conv-b", "bob", JobPriority::Normal, JobCategory::Standard)
            .await
            .unwrap();
    }

    wait_until!(
        h.engine.store().list_all().await.unwrap().len() == 5 && all_terminal(&h.engine).await
    );

    for job in h.engine.store().list_all().await.unwrap() {
        assert_eq!(job.status, JobStatus::Completed);
    }

    // Within each project the execution order matches arrival order.
    let seen = h.runner.seen.lock().await.clone();
    let p1: Vec<&str> = seen.iter().map(|s| s.as_str()).filter(|s| s.starts_with("p1")).collect();
    let p2: Vec<&str> = seen.iter().map(|s| s.as_str()).filter(|s| s.starts_with("p2")).collect();
    assert_eq!(p1, vec!["p1 first", "p1 second", "p1 third"]);
    assert_eq!(p2, vec!["p2 first", "p2 second"]);
}

#[tokio::test]
async fn shutdown_fails_active_sessions() {
    let h = harness();
    h.engine
        .enqueue("p1", "hold for input", "conv", "alice", JobPriority::Normal, JobCategory::Standard)
        .await
        .unwrap();

    wait_until!(h.engine.sessions().active_for("p1", "conv").await.unwrap().is_some());
    h.engine.shutdown().await.unwrap();

    assert!(h.engine.sessions().list_active().await.unwrap().is_empty());
}
