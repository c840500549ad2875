//! Metrics module for Prometheus-based monitoring.
//!
//! Covers stage invocations, queue backlog, live workers, autoscaler actions,
//! ledger write failures and request outcomes.
//!
//! # Example
//!
//! ```ignore
//! use gaia::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_stage("llm", "completed", 42.0);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};
