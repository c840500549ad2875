//! Persistent record of stage outcomes.
//!
//! The result ledger is append-only and selected by URL:
//! - `sqlite://<path>`: `task_results` table
//! - `redis://...`: one key per entry, `result:{stage}:{timestamp}`
//!
//! # Usage
//!
//! ```rust,ignore
//! use gaia::storage::{LedgerEntry, LedgerOutcome, ResultLedger};
//!
//! let ledger = ResultLedger::open("sqlite://data/results.sqlite").await?;
//! ledger.record(LedgerEntry::new("p-1", Stage::Chunker, input, LedgerOutcome::Output(result)));
//! ```

pub mod ledger;

pub use ledger::{LedgerEntry, LedgerOutcome, LedgerStore, RedisLedger, ResultLedger, SqliteLedger};
