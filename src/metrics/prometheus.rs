//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by GAIA and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all GAIA metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage invocations, labeled by stage and outcome.
pub static STAGE_INVOCATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage invocation duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Sampled queue backlog, labeled by stage.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Live worker containers, labeled by stage.
pub static LIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Autoscaler actions, labeled by stage and action (scale_up/scale_down).
pub static SCALING_ACTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Ledger writes that failed.
pub static LEDGER_FAILURES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Finished requests, labeled by final status.
pub static REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Stage metrics
    let stage_invocations_total = CounterVec::new(
        Opts::new("gaia_stage_invocations_total", "Stage invocations by outcome"),
        &["stage", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "gaia_stage_duration_seconds",
            "Stage invocation duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 240.0]),
        &["stage"],
    )?;

    // Queue and worker metrics
    let queue_depth = GaugeVec::new(
        Opts::new("gaia_queue_depth", "Sampled stage queue backlog"),
        &["stage"],
    )?;

    let live_workers = GaugeVec::new(
        Opts::new("gaia_live_workers", "Live worker containers"),
        &["stage"],
    )?;

    let scaling_actions_total = CounterVec::new(
        Opts::new("gaia_scaling_actions_total", "Autoscaler actions"),
        &["stage", "action"],
    )?;

    // Ledger and request metrics
    let ledger_failures_total = Counter::new(
        "gaia_ledger_failures_total",
        "Result ledger writes that failed",
    )?;

    let requests_total = CounterVec::new(
        Opts::new("gaia_requests_total", "Finished pipeline requests"),
        &["status"],
    )?;

    registry.register(Box::new(stage_invocations_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(live_workers.clone()))?;
    registry.register(Box::new(scaling_actions_total.clone()))?;
    registry.register(Box::new(ledger_failures_total.clone()))?;
    registry.register(Box::new(requests_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = STAGE_INVOCATIONS_TOTAL.set(stage_invocations_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = LIVE_WORKERS.set(live_workers);
    let _ = SCALING_ACTIONS_TOTAL.set(scaling_actions_total);
    let _ = LEDGER_FAILURES_TOTAL.set(ledger_failures_total);
    let _ = REQUESTS_TOTAL.set(requests_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the text exposition to `path` for a node-exporter textfile collector.
pub async fn write_metrics_file(path: &std::path::Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, export_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = STAGE_INVOCATIONS_TOTAL.get() {
            counter.with_label_values(&["chunker", "completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("gaia_stage_invocations_total"));
    }

    #[tokio::test]
    async fn test_write_metrics_file() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaia.prom");

        write_metrics_file(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.is_empty());
    }
}
