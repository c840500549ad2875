//! Worker container lifecycle.
//!
//! A worker moves through `Starting → Running → Stopped`. The runtime stop is
//! issued exactly once per successfully launched container, whichever of
//! `stop`, a timed-out collector, the autoscaler or a dropped `WorkerGuard`
//! gets there first.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::docker_client::{ContainerConfig, DockerClient};
use super::resources::limits_for_stage;
use crate::error::WorkerError;
use crate::metrics::MetricsCollector;
use crate::pipeline::Stage;

/// Bytes of log output kept in a `WorkerCrashed` error.
const CRASH_OUTPUT_LIMIT: usize = 4096;

/// What a worker container is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Runs exactly one stage invocation and exits.
    Task(Uuid),
    /// Long-lived worker consuming the stage queue.
    Pool,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Task(_) => "task",
            WorkerRole::Pool => "pool",
        }
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopped,
}

/// Everything needed to launch one worker container.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub stage: Stage,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub command: Option<Vec<String>>,
    pub role: WorkerRole,
}

impl WorkerSpec {
    pub fn new(stage: Stage, image: impl Into<String>, role: WorkerRole) -> Self {
        Self {
            stage,
            image: image.into(),
            env: BTreeMap::new(),
            command: None,
            role,
        }
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the container command.
    pub fn with_command(mut self, command: Option<Vec<String>>) -> Self {
        self.command = command;
        self
    }
}

/// Exit code and captured logs of a finished worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub exit_code: i64,
    pub logs: String,
}

/// Container runtime seam. `DockerRuntime` is the production implementation.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Creates and starts a container, returning its id.
    async fn launch(&self, name: &str, spec: &WorkerSpec) -> Result<String, WorkerError>;

    /// Blocks until the container exits, returning its exit code.
    async fn wait(&self, container_id: &str) -> Result<i64, WorkerError>;

    /// Reads the container's combined output.
    async fn logs(&self, container_id: &str) -> Result<String, WorkerError>;

    /// Stops and removes the container.
    async fn terminate(&self, container_id: &str, grace: Duration) -> Result<(), WorkerError>;
}

/// Docker-backed [`WorkerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    client: DockerClient,
}

impl DockerRuntime {
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkerRuntime for DockerRuntime {
    async fn launch(&self, name: &str, spec: &WorkerSpec) -> Result<String, WorkerError> {
        self.client.ensure_image(&spec.image).await?;

        let config = ContainerConfig::new(name, &spec.image)
            .with_cmd(spec.command.clone())
            .with_env(&spec.env)
            .with_limits(limits_for_stage(spec.stage))
            .with_label("gaia.stage", spec.stage.as_str())
            .with_label("gaia.role", spec.role.as_str());

        let id = self.client.create_container(&config).await?;

        if let Err(e) = self.client.start_container(&id).await {
            if let Err(cleanup) = self.client.remove_container(&id).await {
                warn!(container_id = %id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(WorkerError::StartFailed {
                image: spec.image.clone(),
                reason: e.to_string(),
            });
        }

        Ok(id)
    }

    async fn wait(&self, container_id: &str) -> Result<i64, WorkerError> {
        self.client.wait_container(container_id).await
    }

    async fn logs(&self, container_id: &str) -> Result<String, WorkerError> {
        self.client.read_logs(container_id).await
    }

    async fn terminate(&self, container_id: &str, grace: Duration) -> Result<(), WorkerError> {
        // A container that already exited rejects stop; removal still has to happen.
        if let Err(e) = self.client.stop_container(container_id, grace).await {
            debug!(container_id = %container_id, error = %e, "Stop before removal failed");
        }
        self.client.remove_container(container_id).await
    }
}

#[derive(Debug)]
enum Phase {
    Starting,
    Running(String),
    Stopped,
}

#[derive(Debug)]
struct HandleInner {
    id: Uuid,
    stage: Stage,
    role: WorkerRole,
    created_at: DateTime<Utc>,
    phase: Mutex<Phase>,
    output_taken: AtomicBool,
}

/// Shared handle to one worker container.
///
/// Clones refer to the same worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inner: Arc<HandleInner>,
}

/// What a caller of `begin_stop` must do next.
enum StopAction {
    Nothing,
    Terminate(String),
}

impl WorkerHandle {
    /// Creates a handle in the `Starting` state with no container yet.
    pub fn new(stage: Stage, role: WorkerRole) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                stage,
                role,
                created_at: Utc::now(),
                phase: Mutex::new(Phase::Starting),
                output_taken: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn stage(&self) -> Stage {
        self.inner.stage
    }

    pub fn role(&self) -> WorkerRole {
        self.inner.role
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> WorkerState {
        match &*self.phase() {
            Phase::Starting => WorkerState::Starting,
            Phase::Running(_) => WorkerState::Running,
            Phase::Stopped => WorkerState::Stopped,
        }
    }

    pub fn container_id(&self) -> Option<String> {
        match &*self.phase() {
            Phase::Running(id) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WorkerState::Stopped
    }

    pub fn same_worker(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.inner.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the launched container. If the handle was stopped while the
    /// launch was in flight, the caller owns the single terminate.
    fn attach(&self, container_id: String) -> StopAction {
        let mut phase = self.phase();
        match *phase {
            Phase::Starting => {
                *phase = Phase::Running(container_id);
                StopAction::Nothing
            }
            _ => StopAction::Terminate(container_id),
        }
    }

    fn begin_stop(&self) -> StopAction {
        let mut phase = self.phase();
        match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Running(id) => StopAction::Terminate(id),
            Phase::Starting | Phase::Stopped => StopAction::Nothing,
        }
    }

    fn take_output(&self) -> bool {
        !self.inner.output_taken.swap(true, Ordering::SeqCst)
    }
}

/// Live workers by stage. One lock per stage.
#[derive(Debug)]
pub struct WorkerRegistry {
    stages: HashMap<Stage, Mutex<Vec<WorkerHandle>>>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            stages: Stage::ALL
                .into_iter()
                .map(|stage| (stage, Mutex::new(Vec::new())))
                .collect(),
        }
    }

    fn with_stage<T>(&self, stage: Stage, f: impl FnOnce(&mut Vec<WorkerHandle>) -> T) -> Option<T> {
        self.stages.get(&stage).map(|slot| {
            let mut workers = slot.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut workers)
        })
    }

    pub fn register(&self, handle: &WorkerHandle) -> usize {
        self.with_stage(handle.stage(), |workers| {
            workers.push(handle.clone());
            workers.len()
        })
        .unwrap_or(0)
    }

    pub fn deregister(&self, handle: &WorkerHandle) -> usize {
        self.with_stage(handle.stage(), |workers| {
            workers.retain(|w| !w.same_worker(handle));
            workers.len()
        })
        .unwrap_or(0)
    }

    /// All live workers of a stage.
    pub fn count(&self, stage: Stage) -> usize {
        self.with_stage(stage, |workers| workers.len()).unwrap_or(0)
    }

    /// Live pool workers of a stage.
    pub fn pool_count(&self, stage: Stage) -> usize {
        self.with_stage(stage, |workers| {
            workers
                .iter()
                .filter(|w| w.role() == WorkerRole::Pool && !w.is_stopped())
                .count()
        })
        .unwrap_or(0)
    }

    /// Removes and returns up to `n` pool workers, newest first.
    ///
    /// Task-bound workers are never selected.
    pub fn take_newest_pool(&self, stage: Stage, n: usize) -> Vec<WorkerHandle> {
        self.with_stage(stage, |workers| {
            let mut taken = Vec::new();
            let mut index = workers.len();
            while index > 0 && taken.len() < n {
                index -= 1;
                if workers[index].role() == WorkerRole::Pool && !workers[index].is_stopped() {
                    taken.push(workers.remove(index));
                }
            }
            taken
        })
        .unwrap_or_default()
    }

    /// Removes and returns every pool worker of a stage.
    pub fn drain_pool(&self, stage: Stage) -> Vec<WorkerHandle> {
        self.take_newest_pool(stage, usize::MAX)
    }
}

/// Starts, waits on and stops worker containers.
#[derive(Clone)]
pub struct LifecycleManager {
    runtime: Arc<dyn WorkerRuntime>,
    registry: Arc<WorkerRegistry>,
    stop_grace: Duration,
    metrics: MetricsCollector,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn WorkerRuntime>) -> Self {
        Self {
            runtime,
            registry: Arc::new(WorkerRegistry::new()),
            stop_grace: Duration::from_secs(10),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the SIGTERM grace period used when stopping workers.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Launches a worker and registers it.
    pub async fn start(&self, spec: WorkerSpec) -> Result<WorkerHandle, WorkerError> {
        let handle = WorkerHandle::new(spec.stage, spec.role);
        self.start_handle(&handle, spec).await?;
        Ok(handle)
    }

    /// Launches a worker into a handle the caller already holds.
    ///
    /// The handle is registered before the launch begins, so a concurrent
    /// `stop` on it (for example from a timed-out caller) always reaches the
    /// container. The launch itself runs on its own task: if this future is
    /// dropped midway, the handle is stopped and the container is terminated
    /// as soon as the runtime reports it.
    pub async fn start_handle(&self, handle: &WorkerHandle, spec: WorkerSpec) -> Result<(), WorkerError> {
        let live = self.registry.register(handle);
        self.metrics.update_live_workers(spec.stage.as_str(), live);

        let mut pending = PendingStart {
            manager: self,
            handle,
            armed: true,
        };

        let launch = tokio::spawn({
            let manager = self.clone();
            let handle = handle.clone();
            async move { manager.launch(&handle, spec).await }
        });

        let result = match launch.await {
            Ok(result) => result,
            Err(e) => Err(WorkerError::Runtime(format!("worker launch task failed: {e}"))),
        };
        if result.is_ok() {
            pending.armed = false;
        }
        result
    }

    async fn launch(&self, handle: &WorkerHandle, spec: WorkerSpec) -> Result<(), WorkerError> {
        if handle.is_stopped() {
            return Err(WorkerError::NotStarted(handle.id().to_string()));
        }

        let short_id = handle.id().simple().to_string();
        let name = format!("gaia-{}-{}", spec.stage.as_str().replace('_', "-"), &short_id[..12]);

        match self.runtime.launch(&name, &spec).await {
            Ok(container_id) => {
                debug!(
                    worker_id = %handle.id(),
                    stage = %spec.stage,
                    role = spec.role.as_str(),
                    container_id = %container_id,
                    "Worker started"
                );
                if let StopAction::Terminate(id) = handle.attach(container_id) {
                    // Stopped while launching: this path owns the terminate.
                    self.terminate(handle, &id).await;
                }
                Ok(())
            }
            Err(e) => {
                self.abandon(handle);
                warn!(stage = %spec.stage, image = %spec.image, error = %e, "Worker failed to start");
                Err(e)
            }
        }
    }

    /// Marks a handle stopped and drops it from the registry. Callable from
    /// `Drop`: a launch still in flight terminates its own container, and an
    /// already attached one is terminated on a spawned task.
    fn abandon(&self, handle: &WorkerHandle) {
        if let StopAction::Terminate(id) = handle.begin_stop() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let manager = self.clone();
                    let handle = handle.clone();
                    runtime.spawn(async move { manager.terminate(&handle, &id).await });
                }
                Err(_) => warn!(
                    worker_id = %handle.id(),
                    container_id = %id,
                    "Worker abandoned outside a runtime; container not stopped"
                ),
            }
        }
        let live = self.registry.deregister(handle);
        self.metrics.update_live_workers(handle.stage().as_str(), live);
    }

    /// Waits for the worker to exit and consumes its output.
    ///
    /// A second call on the same handle fails with `OutputConsumed`.
    pub async fn wait(&self, handle: &WorkerHandle) -> Result<RawOutput, WorkerError> {
        if !handle.take_output() {
            return Err(WorkerError::OutputConsumed(handle.id().to_string()));
        }

        let container_id = handle
            .container_id()
            .ok_or_else(|| WorkerError::NotStarted(handle.id().to_string()))?;

        let exit_code = self.runtime.wait(&container_id).await?;
        let logs = self.runtime.logs(&container_id).await?;

        if exit_code != 0 {
            return Err(WorkerError::Crashed {
                exit_code,
                output: tail(&logs, CRASH_OUTPUT_LIMIT),
            });
        }

        Ok(RawOutput { exit_code, logs })
    }

    /// Stops the worker. Idempotent and never fails; runtime errors are logged.
    pub async fn stop(&self, handle: &WorkerHandle) {
        if let StopAction::Terminate(id) = handle.begin_stop() {
            self.terminate(handle, &id).await;
        }
        let live = self.registry.deregister(handle);
        self.metrics.update_live_workers(handle.stage().as_str(), live);
    }

    async fn terminate(&self, handle: &WorkerHandle, container_id: &str) {
        match self.runtime.terminate(container_id, self.stop_grace).await {
            Ok(()) => debug!(
                worker_id = %handle.id(),
                stage = %handle.stage(),
                container_id = %container_id,
                "Worker stopped"
            ),
            Err(e) => warn!(
                worker_id = %handle.id(),
                stage = %handle.stage(),
                container_id = %container_id,
                error = %e,
                "Failed to stop worker"
            ),
        }
    }

    /// Starts a worker guarded against leaks.
    pub async fn acquire(&self, spec: WorkerSpec) -> Result<WorkerGuard, WorkerError> {
        let handle = WorkerHandle::new(spec.stage, spec.role);
        self.acquire_for(handle, spec).await
    }

    /// Same as [`acquire`](Self::acquire) for a handle created by the caller.
    pub async fn acquire_for(&self, handle: WorkerHandle, spec: WorkerSpec) -> Result<WorkerGuard, WorkerError> {
        self.start_handle(&handle, spec).await?;
        Ok(WorkerGuard {
            manager: self.clone(),
            handle,
            released: false,
        })
    }

    /// Runs `f` with a started worker and stops the worker afterwards, on
    /// every exit path including cancellation.
    pub async fn scoped<F, Fut, T>(&self, spec: WorkerSpec, f: F) -> Result<T, WorkerError>
    where
        F: FnOnce(WorkerHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(spec).await?;
        let result = f(guard.handle().clone()).await;
        guard.release().await;
        Ok(result)
    }
}

/// Cleans up after a `start_handle` future that did not run to success.
struct PendingStart<'a> {
    manager: &'a LifecycleManager,
    handle: &'a WorkerHandle,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon(self.handle);
        }
    }
}

/// Owns a started worker; stops it on `release` or, as a fallback, on drop.
pub struct WorkerGuard {
    manager: LifecycleManager,
    handle: WorkerHandle,
    released: bool,
}

impl WorkerGuard {
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Stops the worker now.
    pub async fn release(mut self) {
        self.released = true;
        self.manager.stop(&self.handle).await;
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.released || self.handle.is_stopped() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                let handle = self.handle.clone();
                runtime.spawn(async move { manager.stop(&handle).await });
            }
            Err(_) => warn!(
                worker_id = %self.handle.id(),
                "Worker guard dropped outside a runtime; container not stopped"
            ),
        }
    }
}

fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
