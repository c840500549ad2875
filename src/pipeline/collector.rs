//! Result collection for dispatched stage tasks.
//!
//! `ResultCollector::await_result` drives one stage task from its published
//! message to an `Outcome`: it runs or awaits the worker, retries transient
//! failures with exponential backoff, and on timeout stops the worker that is
//! still running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::payload::parse_worker_output;
use super::stage::Stage;
use super::task::{StageState, StageTask};
use crate::config::{ExecutionPolicy, OrchestratorConfig};
use crate::error::StageError;
use crate::execution::{LifecycleManager, WorkerHandle, WorkerRole, WorkerSpec};
use crate::scheduler::{QueueKeys, TaskEnvelope, TaskHandle, TaskQueue};

/// Final result of waiting on a stage task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(StageError),
    TimedOut,
}

impl Outcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::TimedOut => "timed_out",
        }
    }
}

/// Attempt cap and backoff schedule for one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub base: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: 2,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn for_stage(config: &OrchestratorConfig, stage: Stage) -> Self {
        Self {
            max_attempts: config.stage(stage).max_attempts,
            base: config.backoff_base,
            unit: config.backoff_unit,
        }
    }

    /// Pause after the `attempt`-th failure: `unit * base^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(self.base.saturating_pow(attempt))
    }

    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Deadline shared by every attempt of one `await_result` call.
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn expired(&self) -> StageError {
        StageError::WorkerTimeout {
            seconds: self.timeout.as_secs(),
        }
    }
}

/// Worker currently serving the task, if any. Read back on timeout.
type CurrentWorker = Mutex<Option<WorkerHandle>>;

fn set_current(slot: &CurrentWorker, handle: Option<WorkerHandle>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = handle;
}

fn take_current(slot: &CurrentWorker) -> Option<WorkerHandle> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn advance(task: &mut StageTask, next: StageState) {
    if let Err(e) = task.transition(next) {
        debug!(request_id = %task.request_id, stage = %task.stage, error = %e, "Ignored state change");
    }
}

/// Publishes stage tasks and waits for their outcomes.
#[derive(Clone)]
pub struct ResultCollector {
    queue: Arc<dyn TaskQueue>,
    lifecycle: LifecycleManager,
    config: Arc<OrchestratorConfig>,
    keys: QueueKeys,
}

impl ResultCollector {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        lifecycle: LifecycleManager,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let keys = QueueKeys::new(config.namespace.clone());
        Self {
            queue,
            lifecycle,
            config,
            keys,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Publishes the next attempt of `task` and marks it Dispatched.
    ///
    /// Each call counts as one attempt, successful or not. A failed publish
    /// is also stored in `task.last_error`.
    pub async fn dispatch(&self, task: &mut StageTask) -> Result<(), StageError> {
        task.attempts += 1;
        task.handle = None;

        let published = self.publish(task).await;
        match published {
            Ok(handle) => {
                task.handle = Some(handle);
                advance(task, StageState::Dispatched);
                Ok(())
            }
            Err(e) => {
                warn!(
                    request_id = %task.request_id,
                    stage = %task.stage,
                    attempt = task.attempts,
                    error = %e,
                    "Failed to publish stage task"
                );
                task.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn publish(&self, task: &StageTask) -> Result<TaskHandle, StageError> {
        let input = task.input.as_ref().ok_or_else(|| {
            StageError::MalformedInput(format!("no input built for stage '{}'", task.stage))
        })?;
        let payload = input
            .to_payload()
            .map_err(|e| StageError::MalformedInput(e.to_string()))?;

        let envelope = TaskEnvelope::new(task.request_id.clone(), task.stage, payload)
            .with_attempt(task.attempts);
        let reply_to = self.keys.reply(envelope.task_id);
        let envelope = envelope.with_reply_to(reply_to);

        self.queue
            .publish(task.stage, &envelope)
            .await
            .map_err(|e| StageError::Connection(e.to_string()))
    }

    /// Waits for the outcome of `task`, publishing it first if needed.
    ///
    /// `timeout` bounds every attempt together. On expiry the running worker,
    /// if any, is stopped and `Outcome::TimedOut` is returned.
    pub async fn await_result(&self, task: &mut StageTask, timeout: Duration) -> Outcome {
        let current: CurrentWorker = Mutex::new(None);
        let deadline = Deadline::after(timeout);

        let outcome = match tokio::time::timeout(timeout, self.attempts(task, &current, &deadline))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::TimedOut,
        };

        if let Some(handle) = take_current(&current) {
            warn!(
                request_id = %task.request_id,
                stage = %task.stage,
                worker_id = %handle.id(),
                timeout_secs = timeout.as_secs(),
                "Stage timed out, stopping worker"
            );
            self.lifecycle.stop(&handle).await;
        }

        match &outcome {
            Outcome::Completed(_) => task.last_error = None,
            Outcome::Failed(e) => task.last_error = Some(e.clone()),
            Outcome::TimedOut => task.last_error = Some(deadline.expired()),
        }
        outcome
    }

    async fn attempts(
        &self,
        task: &mut StageTask,
        current: &CurrentWorker,
        deadline: &Deadline,
    ) -> Outcome {
        let policy = RetryPolicy::for_stage(&self.config, task.stage);

        loop {
            let result = match task.handle.clone() {
                Some(handle) => self.collect(task, &handle, current, deadline).await,
                None if task.attempts == 0 => match self.dispatch(task).await {
                    Ok(()) => continue,
                    Err(e) => Err(e),
                },
                None => Err(task.last_error.clone().unwrap_or_else(|| {
                    StageError::Connection("task was never published".to_string())
                })),
            };

            let error = match result {
                Ok(value) => return Outcome::Completed(value),
                Err(error) => error,
            };

            task.handle = None;
            task.last_error = Some(error.clone());

            if let StageError::WorkerTimeout { .. } = error {
                return Outcome::TimedOut;
            }
            if !error.is_retryable() || !policy.allows_another(task.attempts) {
                return Outcome::Failed(error);
            }

            let delay = policy.delay_for(task.attempts);
            info!(
                request_id = %task.request_id,
                stage = %task.stage,
                attempt = task.attempts,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying stage"
            );
            tokio::time::sleep(delay).await;

            // A failed publish leaves no handle; the next pass reports it.
            let _ = self.dispatch(task).await;
        }
    }

    async fn collect(
        &self,
        task: &mut StageTask,
        handle: &TaskHandle,
        current: &CurrentWorker,
        deadline: &Deadline,
    ) -> Result<Value, StageError> {
        match self.config.execution_policy {
            ExecutionPolicy::Ephemeral => {
                let claimed = self
                    .queue
                    .claim(handle)
                    .await
                    .map_err(|e| StageError::Connection(e.to_string()))?;
                if claimed {
                    self.run_worker(task, handle, current).await
                } else {
                    // A pool worker took the message first.
                    self.await_reply(handle, deadline).await
                }
            }
            ExecutionPolicy::Pooled => self.await_reply(handle, deadline).await,
        }
    }

    /// Runs the invocation in a dedicated task container.
    async fn run_worker(
        &self,
        task: &mut StageTask,
        handle: &TaskHandle,
        current: &CurrentWorker,
    ) -> Result<Value, StageError> {
        let envelope: TaskEnvelope = serde_json::from_str(&handle.message)
            .map_err(|e| StageError::MalformedInput(e.to_string()))?;
        let settings = self.config.stage(task.stage);

        let spec = WorkerSpec::new(task.stage, settings.image, WorkerRole::Task(handle.task_id))
            .with_command(settings.command)
            .with_env("INPUT_DATA", envelope.payload.to_string())
            .with_env("TASK_ID", handle.task_id.to_string())
            .with_env("STAGE", task.stage.as_str());

        // Visible to the timeout path before the launch begins.
        let worker = WorkerHandle::new(task.stage, WorkerRole::Task(handle.task_id));
        set_current(current, Some(worker.clone()));

        let guard = match self.lifecycle.acquire_for(worker, spec).await {
            Ok(guard) => guard,
            Err(e) => {
                set_current(current, None);
                return Err(e.into());
            }
        };
        advance(task, StageState::Running);

        let output = self.lifecycle.wait(guard.handle()).await;
        guard.release().await;
        set_current(current, None);

        let output = output?;
        debug!(
            request_id = %task.request_id,
            stage = %task.stage,
            bytes = output.logs.len(),
            "Worker finished"
        );
        parse_worker_output(&output.logs)
    }

    /// Waits for a pool worker's reply.
    async fn await_reply(
        &self,
        handle: &TaskHandle,
        deadline: &Deadline,
    ) -> Result<Value, StageError> {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(deadline.expired());
        }

        let reply = self
            .queue
            .await_reply(handle, remaining)
            .await
            .map_err(|e| StageError::Connection(e.to_string()))?;

        match reply {
            Some(reply) => parse_worker_output(&reply),
            None => Err(deadline.expired()),
        }
    }
}
