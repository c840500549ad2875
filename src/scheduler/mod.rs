//! Broker-facing scheduling: stage queues and pool autoscaling.
//!
//! - **TaskQueue**: narrow broker interface (`RedisTaskQueue` in production)
//! - **TaskEnvelope**: one stage invocation as published to a stage queue
//! - **Autoscaler**: sizes long-lived pool workers from queue backlog
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │ publish
//!          ┌──────────────────┼──────────────────┐
//!          ▼                  ▼                  ▼
//!   gaia:queue:chunker  gaia:queue:prompt   gaia:queue:llm  ◄── sample_depth
//!          │                  │                  │                  │
//!          ▼                  ▼                  ▼            ┌─────┴──────┐
//!     task worker        task worker        pool workers ◄───│ Autoscaler │
//!                                                            └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gaia::scheduler::{Autoscaler, RedisTaskQueue, TaskQueue};
//! use std::sync::Arc;
//!
//! let queue = RedisTaskQueue::connect_with_retry(&config.broker_url, &config.namespace, &config.connect_retry).await?;
//! queue.declare_queues(true).await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let autoscaler = Autoscaler::new(Arc::new(queue), lifecycle, config).spawn(shutdown_rx);
//!
//! // Graceful shutdown stops every pool worker
//! let _ = shutdown_tx.send(());
//! autoscaler.await?;
//! ```

pub mod autoscaler;
pub mod envelope;
pub mod queue;

pub use autoscaler::{desired_workers, Autoscaler, QueueMetrics, QueueSnapshot, ScalingEvent};
pub use envelope::{TaskEnvelope, TaskHandle};
pub use queue::{connect_with_backoff, QueueError, QueueKeys, RedisTaskQueue, TaskQueue};
