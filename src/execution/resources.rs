//! Resource limits for stage worker containers.
//!
//! Model inference needs far more memory than the other stages, so the `llm`
//! stage runs under the large profile and every other stage under the
//! standard one.

use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// Resource limits applied to one worker container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: i64,
}

impl Default for StageLimits {
    fn default() -> Self {
        Self::standard()
    }
}

impl StageLimits {
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: i64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
        }
    }

    /// Profile for chunking, indexing, graph extraction and prompt assembly.
    pub fn standard() -> Self {
        Self {
            memory_mb: 1024,
            cpu_cores: 1.0,
            max_processes: 100,
        }
    }

    /// Profile for model inference.
    pub fn large() -> Self {
        Self {
            memory_mb: 8192,
            cpu_cores: 4.0,
            max_processes: 500,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }
}

/// Get the container limits for a stage.
pub fn limits_for_stage(stage: Stage) -> StageLimits {
    match stage {
        Stage::Llm => StageLimits::large(),
        _ => StageLimits::standard(),
    }
}
