//! gaia: pipeline orchestration and autoscaling for GAIA document processing.
//!
//! This library dispatches pipeline requests across containerized stage
//! workers, collects their results with retries and deadlines, records every
//! outcome in a result ledger, and scales long-lived pool workers from queue
//! backlog.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, ExecutionPolicy, OrchestratorConfig};
pub use error::{ErrorClass, LedgerError, StageError, WorkerError};
