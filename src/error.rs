//! Error types for GAIA orchestration.
//!
//! Defines the error taxonomy shared across subsystems:
//! - Stage invocation failures and their retry classification
//! - Worker container lifecycle
//! - Result ledger persistence
//!
//! Broker errors live next to the queue client (`scheduler::queue::QueueError`)
//! and configuration errors next to the config loader (`config::ConfigError`).

use thiserror::Error;

use crate::pipeline::Stage;

/// Whether a stage failure may be retried by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient condition, the same invocation may succeed on another attempt.
    Retryable,
    /// The invocation can never succeed as submitted.
    Terminal,
}

/// Errors that end (or interrupt) a single stage invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("ConnectionError: {0}")]
    Connection(String),

    #[error("WorkerStartFailed: {0}")]
    WorkerStartFailed(String),

    #[error("WorkerTimeout: no result after {seconds} seconds")]
    WorkerTimeout { seconds: u64 },

    #[error("WorkerCrashed: exit code {exit_code}: {output}")]
    WorkerCrashed { exit_code: i64, output: String },

    #[error("MalformedInput: {0}")]
    MalformedInput(String),

    #[error("Skipped: dependency '{0}' did not complete")]
    DependencyFailed(Stage),
}

impl StageError {
    /// Classifies the error for the collector's retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            StageError::Connection(_)
            | StageError::WorkerStartFailed(_)
            | StageError::WorkerCrashed { .. } => ErrorClass::Retryable,
            StageError::WorkerTimeout { .. }
            | StageError::MalformedInput(_)
            | StageError::DependencyFailed(_) => ErrorClass::Terminal,
        }
    }

    /// Returns true when another attempt is allowed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Errors that can occur while managing worker containers.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker start failed for image '{image}': {reason}")]
    StartFailed { image: String, reason: String },

    #[error("Worker timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Worker exited with non-zero code {exit_code}: {output}")]
    Crashed { exit_code: i64, output: String },

    #[error("Output of worker '{0}' was already consumed")]
    OutputConsumed(String),

    #[error("Worker '{0}' was never started")]
    NotStarted(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

impl From<WorkerError> for StageError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::StartFailed { .. } => StageError::WorkerStartFailed(err.to_string()),
            WorkerError::Timeout { seconds } => StageError::WorkerTimeout { seconds },
            WorkerError::Crashed { exit_code, output } => {
                StageError::WorkerCrashed { exit_code, output }
            }
            WorkerError::OutputConsumed(_) | WorkerError::NotStarted(_) => {
                StageError::WorkerStartFailed(err.to_string())
            }
            WorkerError::Runtime(msg) => StageError::Connection(msg),
        }
    }
}

/// Errors raised by ledger backends. Logged by the ledger, never propagated.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported ledger backend: {0}")]
    UnsupportedBackend(String),
}
