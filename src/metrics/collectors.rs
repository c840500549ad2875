//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    LEDGER_FAILURES_TOTAL, LIVE_WORKERS, QUEUE_DEPTH, REQUESTS_TOTAL, SCALING_ACTIONS_TOTAL,
    STAGE_DURATION, STAGE_INVOCATIONS_TOTAL,
};

/// Metrics collector for recording GAIA operational metrics.
///
/// Recording before `init_metrics()` is a silent no-op.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one finished stage invocation.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage name
    /// * `outcome` - `completed`, `failed` or `timed_out`
    /// * `duration_secs` - Time from dispatch to outcome
    pub fn record_stage(&self, stage: &str, outcome: &str, duration_secs: f64) {
        if let Some(invocations) = STAGE_INVOCATIONS_TOTAL.get() {
            invocations.with_label_values(&[stage, outcome]).inc();
        }

        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }

        tracing::trace!(
            stage = stage,
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Update the sampled backlog of a stage queue.
    pub fn update_queue_depth(&self, stage: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[stage]).set(depth as f64);
        }
    }

    /// Update the live worker count of a stage.
    pub fn update_live_workers(&self, stage: &str, count: usize) {
        if let Some(live_workers) = LIVE_WORKERS.get() {
            live_workers.with_label_values(&[stage]).set(count as f64);
        }
    }

    /// Record an autoscaler action.
    pub fn record_scaling(&self, stage: &str, action: &str, count: usize) {
        if let Some(actions) = SCALING_ACTIONS_TOTAL.get() {
            actions
                .with_label_values(&[stage, action])
                .inc_by(count as f64);
        }
    }

    pub fn inc_ledger_failures(&self) {
        if let Some(failures) = LEDGER_FAILURES_TOTAL.get() {
            failures.inc();
        }
    }

    /// Record a finished request.
    pub fn record_request(&self, status: &str) {
        if let Some(requests) = REQUESTS_TOTAL.get() {
            requests.with_label_values(&[status]).inc();
        }
    }
}
