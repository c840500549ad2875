//! CLI command definitions for the GAIA orchestrator.
//!
//! This module provides the `gaia` command-line interface: broker and ledger
//! initialization, one-shot request runs, the long-lived `serve` process and
//! a few inspection commands.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::execution::{DockerClient, DockerRuntime, LifecycleManager};
use crate::metrics::init_metrics;
use crate::pipeline::{Orchestrator, PipelineRequest, Stage};
use crate::scheduler::{Autoscaler, QueueError, RedisTaskQueue, TaskQueue};
use crate::storage::{LedgerOutcome, ResultLedger, SqliteLedger};

/// How long one inbox poll blocks before the shutdown flag is checked again.
const INBOX_POLL: Duration = Duration::from_secs(1);

/// GAIA pipeline orchestrator and autoscaler.
#[derive(Parser)]
#[command(name = "gaia")]
#[command(about = "Orchestrate GAIA document-processing pipelines over containerized workers")]
#[command(version)]
#[command(
    long_about = "gaia dispatches each pipeline request across the chunker, graph_db, vector_db, prompt and llm stages, runs stage workers in Docker containers, and scales pool workers from queue backlog.\n\nExample usage:\n  gaia init\n  gaia run --request request.json --autoscale\n  gaia serve --metrics-file /var/lib/gaia/metrics.prom"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file, applied before environment variables.
    #[arg(short, long, global = true, env = "GAIA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Wait for the broker, declare durable stage queues and create the ledger schema.
    Init,

    /// Run one pipeline request end-to-end and print its status map.
    Run(RunArgs),

    /// Consume requests from the broker inbox until Ctrl-C.
    Serve(ServeArgs),

    /// Push a request onto the broker inbox.
    Submit(SubmitArgs),

    /// Print the stored status map of a served request.
    Status(StatusArgs),

    /// Print the backlog of every stage queue.
    Depth(DepthArgs),

    /// Print the most recent ledger rows (SQLite backend).
    Ledger(LedgerArgs),
}

/// Arguments for `gaia run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Request file (JSON, or YAML by extension).
    #[arg(short, long)]
    pub request: PathBuf,

    /// Run the autoscaler in the background for the duration of the run.
    #[arg(long)]
    pub autoscale: bool,
}

/// Arguments for `gaia serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Write the Prometheus text exposition here after every autoscaler tick.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

/// Arguments for `gaia submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Request file (JSON, or YAML by extension).
    #[arg(short, long)]
    pub request: PathBuf,
}

/// Arguments for `gaia status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Request id the status map was stored under.
    pub request_id: String,
}

/// Arguments for `gaia depth`.
#[derive(Parser, Debug)]
pub struct DepthArgs {
    /// Output in JSON format.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `gaia ledger`.
#[derive(Parser, Debug)]
pub struct LedgerArgs {
    /// Number of rows to print.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: u32,

    /// Output in JSON format (one entry per line).
    #[arg(short, long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry not initialized");
    }

    let config = Arc::new(
        OrchestratorConfig::load(cli.config.as_deref()).context("Invalid configuration")?,
    );

    match cli.command {
        Commands::Init => run_init_command(config).await?,
        Commands::Run(args) => run_request_command(config, args).await?,
        Commands::Serve(args) => run_serve_command(config, args).await?,
        Commands::Submit(args) => run_submit_command(config, args).await?,
        Commands::Status(args) => run_status_command(config, args).await?,
        Commands::Depth(args) => run_depth_command(config, args).await?,
        Commands::Ledger(args) => run_ledger_command(config, args).await?,
    }
    Ok(())
}

// ============================================================================
// Shared setup
// ============================================================================

async fn connect_queue(config: &OrchestratorConfig) -> anyhow::Result<RedisTaskQueue> {
    let queue =
        RedisTaskQueue::connect_with_retry(&config.broker_url, &config.namespace, &config.connect_retry)
            .await?;
    Ok(queue)
}

fn build_lifecycle() -> anyhow::Result<LifecycleManager> {
    let client = DockerClient::new()?;
    Ok(LifecycleManager::new(Arc::new(DockerRuntime::new(client))))
}

/// Opens the configured ledger; a broken ledger never blocks request flow.
async fn open_ledger(config: &OrchestratorConfig) -> ResultLedger {
    match ResultLedger::open(&config.result_backend).await {
        Ok(ledger) => ledger,
        Err(e) => {
            warn!(backend = %config.result_backend, error = %e, "Result ledger disabled");
            ResultLedger::disabled()
        }
    }
}

fn read_request(path: &Path) -> anyhow::Result<PipelineRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {}", path.display()))?;
    parse_request(path, &text)
}

fn parse_request(path: &Path, text: &str) -> anyhow::Result<PipelineRequest> {
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let request = if is_yaml {
        serde_yaml::from_str(text)?
    } else {
        serde_json::from_str(text)?
    };
    Ok(request)
}

// ============================================================================
// Commands
// ============================================================================

async fn run_init_command(config: Arc<OrchestratorConfig>) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    queue.declare_queues(true).await?;
    ResultLedger::open(&config.result_backend)
        .await
        .context("Failed to initialize result ledger")?;

    println!("✓ Broker ready at {}", config.broker_url);
    println!("  Queues declared under namespace '{}'", config.namespace);
    println!("  Ledger: {}", config.result_backend);
    Ok(())
}

async fn run_request_command(config: Arc<OrchestratorConfig>, args: RunArgs) -> anyhow::Result<()> {
    let request = read_request(&args.request)?;
    let queue: Arc<dyn TaskQueue> = Arc::new(connect_queue(&config).await?);
    let lifecycle = build_lifecycle()?;
    let ledger = open_ledger(&config).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let autoscaler = args.autoscale.then(|| {
        Autoscaler::new(queue.clone(), lifecycle.clone(), config.clone())
            .spawn(shutdown_tx.subscribe())
    });

    let orchestrator = Orchestrator::new(config, queue, lifecycle, ledger);
    let status = orchestrator.run(request).await;

    if let Some(autoscaler) = autoscaler {
        let _ = shutdown_tx.send(());
        if let Err(e) = autoscaler.await {
            error!(error = %e, "Autoscaler task panicked during shutdown");
        }
    }

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_serve_command(config: Arc<OrchestratorConfig>, args: ServeArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    queue.declare_queues(true).await?;
    let shared_queue: Arc<dyn TaskQueue> = Arc::new(queue.clone());
    let lifecycle = build_lifecycle()?;
    let ledger = open_ledger(&config).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut autoscaler = Autoscaler::new(shared_queue.clone(), lifecycle.clone(), config.clone());
    if let Some(path) = args.metrics_file {
        autoscaler = autoscaler.with_metrics_file(path);
    }
    let autoscaler = autoscaler.spawn(shutdown_tx.subscribe());

    let stopping = Arc::new(AtomicBool::new(false));
    {
        let stopping = stopping.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                stopping.store(true, Ordering::SeqCst);
                let _ = shutdown_tx.send(());
            }
        });
    }

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), shared_queue, lifecycle, ledger));
    let permits = config.max_concurrent_requests.max(1);
    let limiter = Arc::new(Semaphore::new(permits));

    info!(
        namespace = %config.namespace,
        max_concurrent_requests = permits,
        "Serving requests"
    );

    while !stopping.load(Ordering::SeqCst) {
        let permit = limiter.clone().acquire_owned().await?;
        let request = match queue.dequeue_request(INBOX_POLL).await {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(QueueError::SerializationFailed(e)) => {
                warn!(error = %e, "Dropped unreadable request");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read request inbox");
                tokio::time::sleep(INBOX_POLL).await;
                continue;
            }
        };

        let orchestrator = orchestrator.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let status = orchestrator.run(request).await;
            if let Err(e) = queue.store_status(&status).await {
                warn!(request_id = %status.request_id, error = %e, "Failed to store status");
            }
            drop(permit);
        });
    }

    // Let in-flight requests finish.
    let _all = limiter.acquire_many(permits as u32).await?;
    if let Err(e) = autoscaler.await {
        error!(error = %e, "Autoscaler task panicked during shutdown");
    }

    let stats = orchestrator.stats();
    info!(
        requests = stats.requests,
        stages_completed = stats.stages_completed,
        stages_failed = stats.stages_failed,
        stages_skipped = stats.stages_skipped,
        "Serve stopped"
    );
    Ok(())
}

async fn run_submit_command(config: Arc<OrchestratorConfig>, args: SubmitArgs) -> anyhow::Result<()> {
    let request = read_request(&args.request)?;
    request.validate()?;

    let queue = connect_queue(&config).await?;
    queue.enqueue_request(&request).await?;

    println!("✓ Submitted request {}", request.id);
    Ok(())
}

async fn run_status_command(config: Arc<OrchestratorConfig>, args: StatusArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;
    match queue.fetch_status(&args.request_id).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => anyhow::bail!("no status stored for request '{}'", args.request_id),
    }
    Ok(())
}

/// Row of `gaia depth --json`.
#[derive(Debug, Serialize)]
struct DepthRow {
    stage: Stage,
    depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn run_depth_command(config: Arc<OrchestratorConfig>, args: DepthArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&config).await?;

    let mut rows = Vec::new();
    for stage in Stage::ALL {
        let row = match queue.sample_depth(stage).await {
            Ok(depth) => DepthRow {
                stage,
                depth: Some(depth),
                error: None,
            },
            Err(e) => DepthRow {
                stage,
                depth: None,
                error: Some(e.to_string()),
            },
        };
        rows.push(row);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in rows {
        match (row.depth, row.error) {
            (Some(depth), _) => println!("{:<10} {}", row.stage, depth),
            (None, Some(error)) => println!("{:<10} - ({})", row.stage, error),
            (None, None) => println!("{:<10} -", row.stage),
        }
    }
    Ok(())
}

async fn run_ledger_command(config: Arc<OrchestratorConfig>, args: LedgerArgs) -> anyhow::Result<()> {
    let Some(path) = config.result_backend.strip_prefix("sqlite://") else {
        anyhow::bail!(
            "ledger listing requires a sqlite:// result backend, got '{}'",
            config.result_backend
        );
    };

    let ledger = SqliteLedger::open(Path::new(path)).await?;
    let entries = ledger.recent(args.limit).await?;

    if args.json {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }

    if entries.is_empty() {
        println!("No ledger entries.");
        return Ok(());
    }

    for entry in entries {
        let summary = match &entry.outcome {
            LedgerOutcome::Output(value) => truncate(&value.to_string(), 80),
            LedgerOutcome::Error(message) => format!("ERROR {}", truncate(message, 74)),
        };
        println!(
            "{}  {:<36}  {:<10} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.request_id,
            entry.stage,
            summary
        );
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "gaia",
            "--log-level",
            "debug",
            "run",
            "--request",
            "req.json",
            "--autoscale",
        ])
        .expect("run command should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.request, PathBuf::from("req.json"));
                assert!(args.autoscale);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_parse_ledger_defaults() {
        let cli = Cli::try_parse_from(["gaia", "ledger"]).expect("ledger command should parse");
        match cli.command {
            Commands::Ledger(args) => {
                assert_eq!(args.limit, 20);
                assert!(!args.json);
            }
            _ => panic!("expected ledger command"),
        }
    }

    #[test]
    fn test_parse_status_command() {
        let cli = Cli::try_parse_from(["gaia", "status", "p-7"]).expect("status should parse");
        match cli.command {
            Commands::Status(args) => assert_eq!(args.request_id, "p-7"),
            _ => panic!("expected status command"),
        }
        assert!(Cli::try_parse_from(["gaia", "status"]).is_err());
    }

    #[test]
    fn test_parse_request_json_and_yaml() {
        let json = r#"{"id": "p-1", "domain": "legal", "docsSource": "s3://docs", "queries": ["q"]}"#;
        let request = parse_request(Path::new("req.json"), json).unwrap();
        assert_eq!(request.id, "p-1");
        assert_eq!(request.queries, vec!["q".to_string()]);

        let yaml = "id: p-2\ndomain: medical\ndocsSource: /data/papers\n";
        let request = parse_request(Path::new("req.yaml"), yaml).unwrap();
        assert_eq!(request.docs_source, "/data/papers");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
