//! Queue-driven pool autoscaling.
//!
//! Every tick the autoscaler samples the backlog of each managed stage queue
//! and moves the stage's pool toward
//! `clamp(ceil(depth / max_tasks_per_worker), min_workers, max_workers)`.
//! Stages are rebalanced concurrently; one stage's failure never blocks
//! another, and nothing is raised out of the loop.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::queue::{QueueKeys, TaskQueue};
use crate::config::OrchestratorConfig;
use crate::execution::{LifecycleManager, WorkerRole, WorkerSpec};
use crate::metrics::{write_metrics_file, MetricsCollector};
use crate::pipeline::Stage;

/// Pool size for a backlog of `depth` messages.
///
/// A `per_worker` of zero is treated as one.
pub fn desired_workers(depth: usize, per_worker: usize, min: usize, max: usize) -> usize {
    let wanted = depth.div_ceil(per_worker.max(1));
    wanted.clamp(min, max.max(min))
}

/// Backlog of one stage queue at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMetrics {
    pub stage: Stage,
    pub depth: usize,
    pub sampled_at: DateTime<Utc>,
}

/// What one tick did to one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingEvent {
    ScaledUp {
        stage: Stage,
        depth: usize,
        from: usize,
        to: usize,
    },
    ScaledDown {
        stage: Stage,
        depth: usize,
        from: usize,
        to: usize,
    },
    Steady {
        stage: Stage,
        depth: usize,
        workers: usize,
    },
    SampleFailed {
        stage: Stage,
        error: String,
    },
}

impl ScalingEvent {
    pub fn stage(&self) -> Stage {
        match self {
            ScalingEvent::ScaledUp { stage, .. }
            | ScalingEvent::ScaledDown { stage, .. }
            | ScalingEvent::Steady { stage, .. }
            | ScalingEvent::SampleFailed { stage, .. } => *stage,
        }
    }

    /// Metric label.
    pub fn action(&self) -> &'static str {
        match self {
            ScalingEvent::ScaledUp { .. } => "scale_up",
            ScalingEvent::ScaledDown { .. } => "scale_down",
            ScalingEvent::Steady { .. } => "hold",
            ScalingEvent::SampleFailed { .. } => "sample_failed",
        }
    }
}

/// Latest per-tick snapshot, shared without locking.
pub type QueueSnapshot = Arc<Vec<QueueMetrics>>;

/// Background pool scaler.
pub struct Autoscaler {
    queue: Arc<dyn TaskQueue>,
    lifecycle: LifecycleManager,
    config: Arc<OrchestratorConfig>,
    keys: QueueKeys,
    snapshot_tx: watch::Sender<QueueSnapshot>,
    metrics: MetricsCollector,
    metrics_file: Option<PathBuf>,
}

impl Autoscaler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        lifecycle: LifecycleManager,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        let keys = QueueKeys::new(config.namespace.clone());
        Self {
            queue,
            lifecycle,
            config,
            keys,
            snapshot_tx,
            metrics: MetricsCollector::new(),
            metrics_file: None,
        }
    }

    /// Writes the Prometheus exposition to `path` after every tick.
    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }

    /// Receiver of the per-tick queue snapshots.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Rebalances every managed stage once.
    pub async fn tick(&self) -> Vec<ScalingEvent> {
        let results = join_all(
            self.config
                .autoscale_stages
                .iter()
                .map(|stage| self.rebalance(*stage)),
        )
        .await;

        let mut samples = Vec::with_capacity(results.len());
        let mut events = Vec::with_capacity(results.len());
        for (sample, event) in results {
            samples.extend(sample);
            events.push(event);
        }
        self.snapshot_tx.send_replace(Arc::new(samples));

        if let Some(path) = &self.metrics_file {
            if let Err(e) = write_metrics_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
        }

        events
    }

    async fn rebalance(&self, stage: Stage) -> (Option<QueueMetrics>, ScalingEvent) {
        let depth = match self.queue.sample_depth(stage).await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(stage = %stage, error = %e, "Failed to sample queue depth");
                let event = ScalingEvent::SampleFailed {
                    stage,
                    error: e.to_string(),
                };
                self.metrics.record_scaling(stage.as_str(), event.action(), 1);
                return (None, event);
            }
        };
        self.metrics.update_queue_depth(stage.as_str(), depth);

        let settings = self.config.stage(stage);
        let desired = desired_workers(
            depth,
            self.config.max_tasks_per_worker,
            settings.min_workers,
            settings.max_workers,
        );
        let live = self.lifecycle.registry().pool_count(stage);

        let event = if desired > live {
            let started = self.scale_up(stage, desired - live).await;
            ScalingEvent::ScaledUp {
                stage,
                depth,
                from: live,
                to: live + started,
            }
        } else if desired < live {
            let stopped = self.scale_down(stage, live - desired).await;
            ScalingEvent::ScaledDown {
                stage,
                depth,
                from: live,
                to: live - stopped,
            }
        } else {
            ScalingEvent::Steady {
                stage,
                depth,
                workers: live,
            }
        };

        match &event {
            ScalingEvent::ScaledUp { from, to, .. } | ScalingEvent::ScaledDown { from, to, .. } => {
                info!(stage = %stage, depth, desired, from, to, action = event.action(), "Scaled pool");
                self.metrics
                    .record_scaling(stage.as_str(), event.action(), from.abs_diff(*to));
            }
            _ => debug!(stage = %stage, depth, workers = live, "Pool steady"),
        }

        let sample = QueueMetrics {
            stage,
            depth,
            sampled_at: Utc::now(),
        };
        (Some(sample), event)
    }

    fn pool_spec(&self, stage: Stage) -> WorkerSpec {
        let settings = self.config.stage(stage);
        WorkerSpec::new(stage, settings.image, WorkerRole::Pool)
            .with_command(settings.command)
            .with_env("WORKER_MODE", "pool")
            .with_env("BROKER_URL", self.config.broker_url.clone())
            .with_env("QUEUE_NAME", self.keys.queue(stage))
            .with_env("REPLY_PREFIX", self.keys.reply_prefix())
            .with_env("STAGE", stage.as_str())
    }

    /// Starts `n` pool workers; returns how many came up.
    async fn scale_up(&self, stage: Stage, n: usize) -> usize {
        let results = join_all((0..n).map(|_| self.lifecycle.start(self.pool_spec(stage)))).await;

        let mut started = 0;
        for result in results {
            match result {
                Ok(_) => started += 1,
                Err(e) => warn!(stage = %stage, error = %e, "Failed to start pool worker"),
            }
        }
        started
    }

    /// Stops the `n` newest pool workers; returns how many were stopped.
    async fn scale_down(&self, stage: Stage, n: usize) -> usize {
        let victims = self.lifecycle.registry().take_newest_pool(stage, n);
        let stopped = victims.len();
        join_all(victims.iter().map(|handle| self.lifecycle.stop(handle))).await;
        stopped
    }

    /// Stops every pool worker of every stage.
    pub async fn shutdown(&self) {
        for stage in Stage::ALL {
            let workers = self.lifecycle.registry().drain_pool(stage);
            if workers.is_empty() {
                continue;
            }
            info!(stage = %stage, workers = workers.len(), "Stopping pool workers");
            join_all(workers.iter().map(|handle| self.lifecycle.stop(handle))).await;
        }
    }

    /// Ticks until `shutdown` fires, then stops every pool worker.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.autoscale_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.autoscale_interval.as_secs(),
            stages = ?self.config.autoscale_stages,
            "Autoscaler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        self.shutdown().await;
        info!("Autoscaler stopped");
    }

    /// Runs the loop on a background task.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
