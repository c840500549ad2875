//! Docker execution layer for stage workers.
//!
//! This module provides worker container management using the bollard crate:
//! resource limits per stage, a runtime seam, and the lifecycle manager that
//! guarantees every started worker is stopped exactly once.
//!
//! # Architecture
//!
//! Worker states follow this lifecycle:
//! ```text
//! STARTING → RUNNING → STOPPED
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gaia::execution::{DockerClient, DockerRuntime, LifecycleManager, WorkerRole, WorkerSpec};
//! use std::sync::Arc;
//!
//! let runtime = DockerRuntime::new(DockerClient::new()?);
//! let lifecycle = LifecycleManager::new(Arc::new(runtime));
//!
//! let spec = WorkerSpec::new(Stage::Chunker, "chunker", WorkerRole::Task(task_id))
//!     .with_env("INPUT_DATA", payload.to_string());
//! let output = lifecycle.scoped(spec, |handle| async move { lifecycle.wait(&handle).await }).await?;
//! ```

pub mod docker_client;
pub mod lifecycle;
pub mod resources;

pub use docker_client::{ContainerConfig, DockerClient};
pub use lifecycle::{
    DockerRuntime, LifecycleManager, RawOutput, WorkerGuard, WorkerHandle, WorkerRegistry,
    WorkerRole, WorkerRuntime, WorkerSpec, WorkerState,
};
pub use resources::{limits_for_stage, StageLimits};
