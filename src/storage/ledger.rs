//! Append-only record of every stage outcome.
//!
//! Writes are fire-and-forget: `ResultLedger::record` hands the entry to a
//! spawned task, and a failed write is logged and counted but never reaches
//! the request that produced it.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;

use crate::error::LedgerError;
use crate::metrics::MetricsCollector;
use crate::pipeline::Stage;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS task_results (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id  TEXT    NOT NULL,
    tool        TEXT    NOT NULL,
    input       TEXT    NOT NULL,
    output      TEXT    NOT NULL,
    is_error    INTEGER NOT NULL DEFAULT 0,
    timestamp   TEXT    NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_task_results_request ON task_results(request_id);
"#;

/// Result or error of one stage outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Output(Value),
    Error(String),
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub request_id: String,
    pub stage: Stage,
    pub input: Value,
    #[serde(flatten)]
    pub outcome: LedgerOutcome,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(request_id: impl Into<String>, stage: Stage, input: Value, outcome: LedgerOutcome) -> Self {
        Self {
            request_id: request_id.into(),
            stage,
            input,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, LedgerOutcome::Error(_))
    }
}

/// Storage backend for ledger entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;
}

/// SQLite ledger (`task_results` table).
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Opens (creating if missing) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = %path.display(), "Result ledger opened");
        Ok(Self { pool })
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT request_id, tool, input, output, is_error, timestamp
             FROM task_results ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let tool: String = row.get("tool");
            let stage = Stage::from_str(&tool).map_err(LedgerError::UnsupportedBackend)?;
            let output: String = row.get("output");
            let is_error: bool = row.get("is_error");

            entries.push(LedgerEntry {
                request_id: row.get("request_id"),
                stage,
                input: serde_json::from_str(row.get::<&str, _>("input"))?,
                outcome: if is_error {
                    LedgerOutcome::Error(output)
                } else {
                    LedgerOutcome::Output(serde_json::from_str(&output)?)
                },
                timestamp: row.get("timestamp"),
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let (output, is_error) = match &entry.outcome {
            LedgerOutcome::Output(value) => (serde_json::to_string(value)?, false),
            LedgerOutcome::Error(message) => (message.clone(), true),
        };

        sqlx::query(
            "INSERT INTO task_results (request_id, tool, input, output, is_error, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&entry.request_id)
        .bind(entry.stage.as_str())
        .bind(serde_json::to_string(&entry.input)?)
        .bind(output)
        .bind(is_error)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Redis ledger: one key per entry, `result:{stage}:{unix seconds}`.
#[derive(Clone)]
pub struct RedisLedger {
    redis: ConnectionManager,
}

impl RedisLedger {
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    pub fn key_for(entry: &LedgerEntry) -> String {
        let micros = entry.timestamp.timestamp_micros();
        format!(
            "result:{}:{}.{:06}",
            entry.stage,
            micros.div_euclid(1_000_000),
            micros.rem_euclid(1_000_000)
        )
    }
}

#[async_trait]
impl LedgerStore for RedisLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(Self::key_for(entry), serde_json::to_string(entry)?)
            .await?;
        Ok(())
    }
}

/// Fire-and-forget front of a ledger store.
#[derive(Clone)]
pub struct ResultLedger {
    store: Option<Arc<dyn LedgerStore>>,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for ResultLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.store {
            Some(_) => write!(f, "ResultLedger(active)"),
            None => write!(f, "ResultLedger(disabled)"),
        }
    }
}

impl ResultLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store: Some(store),
            metrics: MetricsCollector::new(),
        }
    }

    /// A ledger that drops every entry.
    pub fn disabled() -> Self {
        Self {
            store: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Opens the backend named by a `sqlite://` or `redis://` URL.
    pub async fn open(backend_url: &str) -> Result<Self, LedgerError> {
        if let Some(path) = backend_url.strip_prefix("sqlite://") {
            let ledger = SqliteLedger::open(Path::new(path)).await?;
            return Ok(Self::new(Arc::new(ledger)));
        }
        if backend_url.starts_with("redis://") || backend_url.starts_with("rediss://") {
            let ledger = RedisLedger::connect(backend_url).await?;
            return Ok(Self::new(Arc::new(ledger)));
        }
        Err(LedgerError::UnsupportedBackend(backend_url.to_string()))
    }

    /// Appends `entry` on a spawned task. Returns the task so callers that
    /// care (tests, shutdown) can await it.
    pub fn record(&self, entry: LedgerEntry) -> Option<JoinHandle<()>> {
        let store = self.store.clone()?;
        let metrics = self.metrics.clone();

        Some(tokio::spawn(async move {
            if let Err(e) = store.append(&entry).await {
                metrics.inc_ledger_failures();
                tracing::warn!(
                    request_id = %entry.request_id,
                    stage = %entry.stage,
                    error = %e,
                    "Failed to record stage outcome"
                );
            }
        }))
    }
}
