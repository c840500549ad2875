//! Stage orchestrator for one pipeline request.
//!
//! This module provides the `Orchestrator` that coordinates:
//! - Building each stage's input from the request and upstream outputs
//! - Dispatching ready stages in declaration order
//! - Awaiting outcomes concurrently, one tokio task per stage
//! - Skipping dependents of failed stages
//! - Ledger writes and metrics for every outcome

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::collector::{Outcome, ResultCollector};
use super::payload::StageInput;
use super::request::{PipelineRequest, RequestStatus, StatusMap};
use super::stage::Stage;
use super::task::{StageState, StageTask};
use crate::config::OrchestratorConfig;
use crate::error::StageError;
use crate::execution::LifecycleManager;
use crate::metrics::MetricsCollector;
use crate::scheduler::TaskQueue;
use crate::storage::{LedgerEntry, LedgerOutcome, ResultLedger};

/// Counters over every request run by one orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub requests: u64,
    pub stages_completed: u64,
    pub stages_failed: u64,
    pub stages_skipped: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    requests: AtomicU64,
    stages_completed: AtomicU64,
    stages_failed: AtomicU64,
    stages_skipped: AtomicU64,
}

/// Runs pipeline requests through the fixed stage graph.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    collector: ResultCollector,
    ledger: ResultLedger,
    metrics: MetricsCollector,
    counters: Arc<StatCounters>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        queue: Arc<dyn TaskQueue>,
        lifecycle: LifecycleManager,
        ledger: ResultLedger,
    ) -> Self {
        let collector = ResultCollector::new(queue, lifecycle, config.clone());
        Self {
            config,
            collector,
            ledger,
            metrics: MetricsCollector::new(),
            counters: Arc::new(StatCounters::default()),
        }
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            stages_completed: self.counters.stages_completed.load(Ordering::Relaxed),
            stages_failed: self.counters.stages_failed.load(Ordering::Relaxed),
            stages_skipped: self.counters.stages_skipped.load(Ordering::Relaxed),
        }
    }

    /// Runs `request` through every stage.
    ///
    /// Never fails: each stage's outcome, including errors and skips, is in
    /// the returned status map.
    pub async fn run(&self, mut request: PipelineRequest) -> StatusMap {
        let started = Instant::now();
        request.set_status(RequestStatus::Processing);
        info!(request_id = %request.id, domain = %request.domain, "Processing request");

        let mut tasks: BTreeMap<Stage, StageTask> = Stage::ALL
            .into_iter()
            .map(|stage| (stage, StageTask::new(request.id.clone(), stage)))
            .collect();

        if let Err(e) = request.validate() {
            warn!(request_id = %request.id, error = %e, "Rejected request");
            for stage in Stage::ALL.into_iter().filter(|s| s.dependencies().is_empty()) {
                if let Some(task) = tasks.get_mut(&stage) {
                    self.finish(task, Outcome::Failed(e.clone()), Duration::ZERO);
                }
            }
        }

        let mut outputs: BTreeMap<Stage, Value> = BTreeMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            for stage in Stage::ALL {
                let Some(task) = tasks.get(&stage) else { continue };
                if task.state() != StageState::Pending || task.attempts > 0 {
                    continue;
                }

                let blocked = stage.dependencies().iter().copied().find(|dep| {
                    matches!(
                        tasks.get(dep).map(StageTask::state),
                        Some(StageState::Failed | StageState::Skipped)
                    )
                });
                if let Some(dep) = blocked {
                    if let Some(task) = tasks.get_mut(&stage) {
                        self.skip(task, dep);
                    }
                    continue;
                }

                let ready = stage
                    .dependencies()
                    .iter()
                    .all(|dep| tasks.get(dep).map(StageTask::state) == Some(StageState::Completed));
                if !ready {
                    continue;
                }

                let Some(task) = tasks.get_mut(&stage) else { continue };
                match StageInput::build(stage, &request, &outputs) {
                    Ok(input) => task.input = Some(input),
                    Err(e) => {
                        self.finish(task, Outcome::Failed(e), Duration::ZERO);
                        continue;
                    }
                }

                // Publish errors are retried by the collector.
                let _ = self.collector.dispatch(task).await;

                let mut in_flight = task.clone();
                let collector = self.collector.clone();
                let timeout = self.config.stage(stage).timeout;
                let join = tokio::spawn(async move {
                    let began = Instant::now();
                    let outcome = collector.await_result(&mut in_flight, timeout).await;
                    (in_flight, outcome, began.elapsed())
                });
                running.push(async move { (stage, join.await) });
            }

            let Some((stage, joined)) = running.next().await else {
                break;
            };

            match joined {
                Ok((mut task, outcome, elapsed)) => {
                    if let Outcome::Completed(value) = &outcome {
                        outputs.insert(stage, value.clone());
                    }
                    self.finish(&mut task, outcome, elapsed);
                    tasks.insert(stage, task);
                }
                Err(e) => {
                    error!(request_id = %request.id, stage = %stage, error = %e, "Stage task aborted");
                    if let Some(task) = tasks.get_mut(&stage) {
                        let failure = StageError::WorkerCrashed {
                            exit_code: -1,
                            output: e.to_string(),
                        };
                        self.finish(task, Outcome::Failed(failure), Duration::ZERO);
                    }
                }
            }
        }

        let states: Vec<StageState> = tasks.values().map(StageTask::state).collect();
        let status = StatusMap::outcome(&states);
        request.set_status(status);
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_request(&status.to_string());

        info!(
            request_id = %request.id,
            status = %status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Request finished"
        );

        StatusMap {
            request_id: request.id,
            status,
            stages: tasks
                .iter()
                .map(|(stage, task)| (*stage, task.report()))
                .collect(),
        }
    }

    fn skip(&self, task: &mut StageTask, dependency: Stage) {
        if let Err(e) = task.skip(dependency) {
            debug!(stage = %task.stage, error = %e, "Ignored skip");
            return;
        }
        self.counters.stages_skipped.fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = %task.request_id,
            stage = %task.stage,
            dependency = %dependency,
            "Stage skipped"
        );
    }

    /// Applies an outcome to the task, then records it.
    fn finish(&self, task: &mut StageTask, outcome: Outcome, elapsed: Duration) {
        let timeout = self.config.stage(task.stage).timeout;
        let applied = match &outcome {
            Outcome::Completed(value) => task.complete(value.clone()),
            Outcome::Failed(e) => task.fail(e.clone()),
            Outcome::TimedOut => task.fail(StageError::WorkerTimeout {
                seconds: timeout.as_secs(),
            }),
        };
        if let Err(e) = applied {
            warn!(request_id = %task.request_id, error = %e, "Outcome not applied");
            return;
        }

        match task.state() {
            StageState::Completed => {
                self.counters.stages_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    request_id = %task.request_id,
                    stage = %task.stage,
                    attempts = task.attempts,
                    "Stage completed"
                );
            }
            _ => {
                self.counters.stages_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = %task.request_id,
                    stage = %task.stage,
                    attempts = task.attempts,
                    error = ?task.last_error.as_ref().map(ToString::to_string),
                    "Stage failed"
                );
            }
        }

        self.metrics
            .record_stage(task.stage.as_str(), outcome.label(), elapsed.as_secs_f64());

        let input = task
            .input
            .as_ref()
            .and_then(|input| input.to_payload().ok())
            .unwrap_or(Value::Null);
        let recorded = match (&task.result, &task.last_error) {
            (Some(result), _) => LedgerOutcome::Output(result.clone()),
            (None, Some(e)) => LedgerOutcome::Error(e.to_string()),
            (None, None) => LedgerOutcome::Error("no result".to_string()),
        };
        self.ledger
            .record(LedgerEntry::new(task.request_id.clone(), task.stage, input, recorded));
    }
}
