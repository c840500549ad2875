//! Stage pipeline for GAIA requests.
//!
//! A request fans out over five stages with a fixed dependency graph:
//!
//! ```text
//! chunker      (independent)
//! vector_db    (independent)
//! graph_db ──► prompt ──► llm
//! ```
//!
//! # Components
//!
//! - **Orchestrator**: dispatches ready stages and aggregates a `StatusMap`
//! - **ResultCollector**: awaits one stage outcome with retries and a deadline
//! - **StageInput**: tagged per-stage payload schemas
//! - **StageTask**: per-stage state machine (`Pending → Dispatched → Running → terminal`)
//!
//! # Example
//!
//! ```rust,ignore
//! use gaia::pipeline::{Orchestrator, PipelineRequest};
//!
//! let orchestrator = Orchestrator::new(config, queue, lifecycle, ledger);
//! let request = PipelineRequest::new("p-1", "legal", "s3://docs/contracts")
//!     .with_queries(vec!["Who are the parties?".to_string()]);
//!
//! let status = orchestrator.run(request).await;
//! println!("{}: {}", status.request_id, status.status);
//! ```
//!
//! A failed stage never aborts the request: its dependents are marked
//! `Skipped`, independent branches keep running, and the request ends
//! `PartialFailure`.

pub mod collector;
pub mod orchestrator;
pub mod payload;
pub mod request;
pub mod stage;
pub mod task;

pub use collector::{Outcome, ResultCollector, RetryPolicy};
pub use orchestrator::{Orchestrator, OrchestratorStats};
pub use payload::{
    check_result, parse_worker_output, ChunkerInput, GraphDbInput, KnowledgeGraph, LlmInput,
    PromptInput, PromptSet, RequestContext, StageInput, VectorDbInput,
};
pub use request::{PipelineRequest, RequestStatus, StageReport, StatusMap};
pub use stage::Stage;
pub use task::{StageState, StageTask, TransitionError};
