//! End-to-end pipeline scenarios over in-process fakes.
//!
//! The broker, container runtime and ledger are replaced by fakes behind the
//! crate's own traits, so every scenario runs without Redis or Docker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use gaia::config::{ConnectRetry, OrchestratorConfig, StageSettings};
use gaia::error::{LedgerError, WorkerError};
use gaia::execution::{LifecycleManager, WorkerRuntime, WorkerSpec};
use gaia::pipeline::{Orchestrator, PipelineRequest, RequestStatus, Stage, StageState, StatusMap};
use gaia::scheduler::{
    connect_with_backoff, QueueError, TaskEnvelope, TaskHandle, TaskQueue,
};
use gaia::storage::{LedgerEntry, LedgerStore, ResultLedger};

// ============================================================================
// Fakes
// ============================================================================

/// Broker that hands every published message straight back to the publisher.
#[derive(Default)]
struct FakeQueue {
    published: Mutex<Vec<TaskEnvelope>>,
}

#[async_trait]
impl TaskQueue for FakeQueue {
    async fn declare_queues(&self, _durable: bool) -> Result<(), QueueError> {
        Ok(())
    }

    async fn publish(&self, stage: Stage, envelope: &TaskEnvelope) -> Result<TaskHandle, QueueError> {
        self.published.lock().unwrap().push(envelope.clone());
        Ok(TaskHandle {
            task_id: envelope.task_id,
            stage,
            queue: format!("test:queue:{}", stage),
            message: serde_json::to_string(envelope)?,
        })
    }

    async fn claim(&self, _handle: &TaskHandle) -> Result<bool, QueueError> {
        Ok(true)
    }

    async fn await_reply(
        &self,
        _handle: &TaskHandle,
        _timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        Ok(None)
    }

    async fn sample_depth(&self, _stage: Stage) -> Result<usize, QueueError> {
        Ok(0)
    }
}

#[derive(Clone)]
enum Behavior {
    Print(String),
    Crash,
    Hang,
}

/// Container runtime whose workers behave per stage.
#[derive(Default)]
struct FakeRuntime {
    behaviors: HashMap<Stage, Behavior>,
    launched: Mutex<Vec<WorkerSpec>>,
    containers: Mutex<HashMap<String, Stage>>,
    terminated: Mutex<Vec<String>>,
}

impl FakeRuntime {
    fn healthy() -> Self {
        let mut behaviors = HashMap::new();
        behaviors.insert(Stage::Chunker, Behavior::Print(r#"{"chunks": ["c1", "c2"]}"#.into()));
        behaviors.insert(
            Stage::GraphDb,
            Behavior::Print("building graph\n{\"kgTriples\": [\"a-rel-b\"], \"ner\": []}".into()),
        );
        behaviors.insert(Stage::VectorDb, Behavior::Print(r#"{"indexed": 2}"#.into()));
        behaviors.insert(
            Stage::Prompt,
            Behavior::Print(r#"{"prompts": {"zeroShot": "Answer using the graph."}}"#.into()),
        );
        behaviors.insert(Stage::Llm, Behavior::Print(r#"{"answers": ["A and B"]}"#.into()));
        Self {
            behaviors,
            ..Default::default()
        }
    }

    fn with(mut self, stage: Stage, behavior: Behavior) -> Self {
        self.behaviors.insert(stage, behavior);
        self
    }

    fn behavior(&self, container_id: &str) -> Behavior {
        let stage = self.containers.lock().unwrap().get(container_id).copied();
        stage
            .and_then(|stage| self.behaviors.get(&stage).cloned())
            .unwrap_or(Behavior::Print("{}".into()))
    }

    fn launches_of(&self, stage: Stage) -> Vec<WorkerSpec> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.stage == stage)
            .cloned()
            .collect()
    }

    fn input_of(&self, stage: Stage) -> Value {
        let spec = self.launches_of(stage).into_iter().next().expect("stage was launched");
        serde_json::from_str(&spec.env["INPUT_DATA"]).unwrap()
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn launch(&self, _name: &str, spec: &WorkerSpec) -> Result<String, WorkerError> {
        let mut launched = self.launched.lock().unwrap();
        launched.push(spec.clone());
        let id = format!("{}-{}", spec.stage, launched.len());
        self.containers.lock().unwrap().insert(id.clone(), spec.stage);
        Ok(id)
    }

    async fn wait(&self, container_id: &str) -> Result<i64, WorkerError> {
        match self.behavior(container_id) {
            Behavior::Print(_) => Ok(0),
            Behavior::Crash => Ok(1),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(0)
            }
        }
    }

    async fn logs(&self, container_id: &str) -> Result<String, WorkerError> {
        match self.behavior(container_id) {
            Behavior::Print(output) => Ok(output),
            Behavior::Crash => Ok("Traceback (most recent call last):\nRuntimeError: boom".into()),
            Behavior::Hang => Ok(String::new()),
        }
    }

    async fn terminate(&self, container_id: &str, _grace: Duration) -> Result<(), WorkerError> {
        self.terminated.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

struct BrokenLedger;

#[async_trait]
impl LedgerStore for BrokenLedger {
    async fn append(&self, _entry: &LedgerEntry) -> Result<(), LedgerError> {
        Err(LedgerError::UnsupportedBackend("ledger offline".into()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::new().with_retry_backoff(2, Duration::from_millis(1))
}

struct Harness {
    orchestrator: Orchestrator,
    runtime: Arc<FakeRuntime>,
}

fn harness(config: OrchestratorConfig, runtime: FakeRuntime, ledger: ResultLedger) -> Harness {
    let runtime = Arc::new(runtime);
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        Arc::new(FakeQueue::default()),
        LifecycleManager::new(runtime.clone()),
        ledger,
    );
    Harness {
        orchestrator,
        runtime,
    }
}

fn request() -> PipelineRequest {
    PipelineRequest::new("proj-1", "legal", "s3://docs/contracts")
        .with_queries(vec!["Who are the parties?".to_string()])
}

fn assert_state(status: &StatusMap, stage: Stage, expected: StageState) {
    assert_eq!(
        status.state(stage),
        Some(expected),
        "stage {} in {:?}",
        stage,
        status
    );
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_all_stages_complete() {
    let h = harness(test_config(), FakeRuntime::healthy(), ResultLedger::disabled());

    let status = h.orchestrator.run(request()).await;

    assert_eq!(status.status, RequestStatus::Completed);
    assert_eq!(status.request_id, "proj-1");
    assert_eq!(status.stages.len(), 5);
    for stage in Stage::ALL {
        assert_state(&status, stage, StageState::Completed);
        assert_eq!(status.stages[&stage].attempts, 1);
    }
    assert_eq!(status.result(Stage::Llm), Some(&json!({"answers": ["A and B"]})));

    let llm_input = h.runtime.input_of(Stage::Llm);
    assert_eq!(llm_input["prompts"]["zeroShot"], json!("Answer using the graph."));
    assert_eq!(llm_input["queries"], json!(["Who are the parties?"]));

    assert_eq!(h.runtime.terminated.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn test_graph_output_feeds_prompt_input() {
    let h = harness(test_config(), FakeRuntime::healthy(), ResultLedger::disabled());

    h.orchestrator.run(request()).await;

    let prompt_input = h.runtime.input_of(Stage::Prompt);
    assert_eq!(prompt_input["kg"]["kgTriples"], json!(["a-rel-b"]));
    assert_eq!(prompt_input["kg"]["ner"], json!([]));
    assert_eq!(prompt_input["id"], json!("proj-1"));
    assert_eq!(prompt_input["domain"], json!("legal"));
}

#[tokio::test]
async fn test_crashing_chunker_fails_alone() {
    let runtime = FakeRuntime::healthy().with(Stage::Chunker, Behavior::Crash);
    let h = harness(test_config(), runtime, ResultLedger::disabled());

    let status = h.orchestrator.run(request()).await;

    assert_state(&status, Stage::Chunker, StageState::Failed);
    assert_eq!(status.stages[&Stage::Chunker].attempts, 3);
    assert!(status.error(Stage::Chunker).unwrap().starts_with("WorkerCrashed"));
    assert_eq!(h.runtime.launches_of(Stage::Chunker).len(), 3);

    assert_state(&status, Stage::GraphDb, StageState::Completed);
    assert_state(&status, Stage::VectorDb, StageState::Completed);
    assert_state(&status, Stage::Llm, StageState::Completed);
    assert_eq!(status.status, RequestStatus::PartialFailure);
}

#[tokio::test]
async fn test_failed_graph_skips_dependents() {
    let runtime = FakeRuntime::healthy().with(
        Stage::GraphDb,
        Behavior::Print(r#"{"error": "docsSource unreachable"}"#.into()),
    );
    let h = harness(test_config(), runtime, ResultLedger::disabled());

    let status = h.orchestrator.run(request()).await;

    assert_state(&status, Stage::GraphDb, StageState::Failed);
    assert_eq!(status.stages[&Stage::GraphDb].attempts, 1);
    assert!(status
        .error(Stage::GraphDb)
        .unwrap()
        .contains("docsSource unreachable"));

    assert_state(&status, Stage::Prompt, StageState::Skipped);
    assert_state(&status, Stage::Llm, StageState::Skipped);
    assert!(status.error(Stage::Llm).unwrap().contains("prompt"));
    assert!(h.runtime.launches_of(Stage::Prompt).is_empty());
    assert!(h.runtime.launches_of(Stage::Llm).is_empty());

    assert_state(&status, Stage::Chunker, StageState::Completed);
    assert_state(&status, Stage::VectorDb, StageState::Completed);
    assert_eq!(status.status, RequestStatus::PartialFailure);
}

#[tokio::test]
async fn test_timeout_stops_worker_once() {
    let config = test_config().with_stage(
        Stage::Llm,
        StageSettings::for_stage(Stage::Llm).with_timeout(Duration::from_millis(100)),
    );
    let runtime = FakeRuntime::healthy().with(Stage::Llm, Behavior::Hang);
    let h = harness(config, runtime, ResultLedger::disabled());

    let status = h.orchestrator.run(request()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_state(&status, Stage::Llm, StageState::Failed);
    assert!(status.error(Stage::Llm).unwrap().starts_with("WorkerTimeout"));

    let llm_stops: Vec<String> = h
        .runtime
        .terminated
        .lock()
        .unwrap()
        .iter()
        .filter(|id| id.starts_with("llm-"))
        .cloned()
        .collect();
    assert_eq!(llm_stops.len(), 1);
    assert_eq!(status.status, RequestStatus::PartialFailure);
}

#[tokio::test]
async fn test_invalid_request_dispatches_nothing() {
    let h = harness(test_config(), FakeRuntime::healthy(), ResultLedger::disabled());
    let request = PipelineRequest::new("proj-2", "legal", "");

    let status = h.orchestrator.run(request).await;

    assert_eq!(status.status, RequestStatus::Failed);
    assert_state(&status, Stage::Chunker, StageState::Failed);
    assert_state(&status, Stage::GraphDb, StageState::Failed);
    assert_state(&status, Stage::VectorDb, StageState::Failed);
    assert_state(&status, Stage::Prompt, StageState::Skipped);
    assert_state(&status, Stage::Llm, StageState::Skipped);
    assert!(status.error(Stage::Chunker).unwrap().contains("docsSource"));
    assert!(h.runtime.launched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_every_outcome_is_recorded() {
    let store = Arc::new(MemoryLedger::default());
    let runtime = FakeRuntime::healthy().with(Stage::Chunker, Behavior::Crash);
    let h = harness(test_config(), runtime, ResultLedger::new(store.clone()));

    h.orchestrator.run(request()).await;

    // Ledger writes are fire-and-forget.
    for _ in 0..100 {
        if store.entries.lock().unwrap().len() >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let entries = store.entries.lock().unwrap();
    assert_eq!(entries.len(), 5);
    let chunker = entries.iter().find(|e| e.stage == Stage::Chunker).unwrap();
    assert!(chunker.is_error());
    let graph = entries.iter().find(|e| e.stage == Stage::GraphDb).unwrap();
    assert!(!graph.is_error());
    assert_eq!(graph.input["docsSource"], json!("s3://docs/contracts"));
}

#[tokio::test]
async fn test_ledger_failure_does_not_affect_request() {
    let h = harness(
        test_config(),
        FakeRuntime::healthy(),
        ResultLedger::new(Arc::new(BrokenLedger)),
    );

    let status = h.orchestrator.run(request()).await;

    assert_eq!(status.status, RequestStatus::Completed);
}

#[tokio::test]
async fn test_requests_run_independently() {
    let h = harness(test_config(), FakeRuntime::healthy(), ResultLedger::disabled());

    let first = request();
    let second = PipelineRequest::new("proj-9", "medical", "/data/papers");
    let (a, b) = tokio::join!(h.orchestrator.run(first), h.orchestrator.run(second));

    assert_eq!(a.status, RequestStatus::Completed);
    assert_eq!(b.status, RequestStatus::Completed);
    assert_eq!(b.request_id, "proj-9");
    assert_eq!(h.orchestrator.stats().requests, 2);
    assert_eq!(h.orchestrator.stats().stages_completed, 10);
}

#[tokio::test]
async fn test_broker_accepts_after_refusals() {
    let retry = ConnectRetry {
        max_attempts: 30,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    let calls = AtomicU32::new(0);

    let result = connect_with_backoff(&retry, |_attempt| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 5 {
                Err(QueueError::ConnectionFailed("connection refused".into()))
            } else {
                Ok("connected")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "connected");
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}
