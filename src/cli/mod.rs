//! Command-line interface for the GAIA orchestrator.
//!
//! Provides commands for broker initialization, running and serving
//! pipeline requests, and inspecting queues and the result ledger.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
