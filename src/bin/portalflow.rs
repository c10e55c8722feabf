//! portalflow CLI: operator interface to the workflow engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use portalflow::config::Config;
use portalflow::config::secrets::ExposeSecret;
use portalflow::db::Db;
use portalflow::engine::{EngineConfig, Orchestrator, SubmitResult};
use portalflow::event::{EventPublisher, LogPublisher, PgmqPublisher};
use portalflow::model::{ExchangeId, ExecutionRecord, WorkflowRequest};
use portalflow::runner::HookRunner;
use portalflow::store::{ExecutionStore, MemoryStore};
use portalflow::telemetry::{TelemetryConfig, init_telemetry};
use portalflow::workflow::WorkflowRegistry;

#[derive(Parser)]
#[command(name = "portalflow", about = "Deduplicating orchestrator for portal workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a workflow request from a JSON file
    Submit {
        /// Path to the request JSON
        file: PathBuf,
        /// Block until the execution reaches a terminal status
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        wait_timeout_secs: u64,
    },
    /// Show an execution record
    Status {
        /// Exchange id
        id: String,
    },
    /// Re-admit failed executions with retriable errors
    RetryFailed {
        /// Cumulative retry cap (defaults to MAX_RETRY_ATTEMPTS)
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Force-fail executions that stopped making progress
    Sweep {
        /// Inactivity threshold (defaults to STALE_AFTER_SECS)
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },
    /// Delete terminal executions past the retention window
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "portalflow".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let engine = build_engine(&config).await?;

    match cli.command {
        Command::Submit {
            file,
            wait,
            wait_timeout_secs,
        } => cmd_submit(&engine, &file, wait, Duration::from_secs(wait_timeout_secs)).await,
        Command::Status { id } => cmd_status(&engine, &id).await,
        Command::RetryFailed { max_retries } => {
            let max = max_retries.unwrap_or(config.max_retry_attempts);
            let report = engine.retry_failed(max).await?;
            println!(
                "found: {}  retried: {}  skipped: {}",
                report.found, report.retried, report.skipped
            );
            engine.wait_idle().await;
            Ok(())
        }
        Command::Sweep { stale_after_secs } => {
            let older_than = stale_after_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_after);
            let swept = engine.sweep_stale(older_than).await?;
            println!("{swept} stale execution(s) failed");
            Ok(())
        }
        Command::Purge => {
            let purged = engine.purge_expired().await?;
            println!("{purged} execution(s) purged");
            Ok(())
        }
    }
}

async fn build_engine(config: &Config) -> anyhow::Result<Orchestrator> {
    let registry = Arc::new(load_registry(&config.workflows_dir)?);
    let runner = Arc::new(HookRunner::new(Arc::clone(&registry), &config.work_dir));

    let (store, publisher): (Arc<dyn ExecutionStore>, Arc<dyn EventPublisher>) =
        match &config.database_url {
            Some(url) => {
                let db = Db::connect(url.expose_secret())
                    .await?
                    .with_dedup_ttl(config.dedup_ttl);
                db.migrate().await?;
                let publisher: Arc<dyn EventPublisher> =
                    Arc::new(PgmqPublisher::new(db.clone(), &config.event_topic).await?);
                let store: Arc<dyn ExecutionStore> = Arc::new(db);
                (store, publisher)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store");
                let store: Arc<dyn ExecutionStore> = Arc::new(MemoryStore::new(config.dedup_ttl));
                let publisher: Arc<dyn EventPublisher> = Arc::new(LogPublisher);
                (store, publisher)
            }
        };

    Ok(
        Orchestrator::new(store, runner, publisher, registry).with_config(EngineConfig {
            retention: config.retention,
            ..EngineConfig::default()
        }),
    )
}

fn load_registry(dir: &Path) -> anyhow::Result<WorkflowRegistry> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "workflow dir missing, no kinds can run");
        return Ok(WorkflowRegistry::empty());
    }
    Ok(WorkflowRegistry::load_from_dir(dir)?)
}

async fn cmd_submit(
    engine: &Orchestrator,
    file: &Path,
    wait: bool,
    wait_timeout: Duration,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let request = WorkflowRequest::from_json(&raw)?;

    let result = engine.submit(request).await?;
    match &result {
        SubmitResult::Admitted(a) => println!("Admitted: {} (status: pending)", a.exchange_id),
        SubmitResult::Duplicate(a) => {
            println!("Duplicate: live execution {} since {}", a.exchange_id, a.created_at)
        }
    }

    if wait {
        let record = engine
            .wait_for(result.exchange_id(), Duration::from_millis(500), wait_timeout)
            .await?;
        print_record(&record)?;
    }
    // In-memory runs die with the process; let admitted work finish.
    engine.wait_idle().await;
    Ok(())
}

async fn cmd_status(engine: &Orchestrator, id: &str) -> anyhow::Result<()> {
    let exchange_id: ExchangeId = id.parse()?;
    match engine.status(exchange_id).await? {
        Some(record) => print_record(&record),
        None => anyhow::bail!("no execution {exchange_id}"),
    }
}

fn print_record(record: &ExecutionRecord) -> anyhow::Result<()> {
    println!("ID:          {}", record.exchange_id);
    println!("Kind:        {}", record.kind);
    println!("Status:      {}", record.status);
    println!("Fingerprint: {}", record.fingerprint);
    println!("Retries:     {}", record.retry_count);
    if let Some(prior) = record.retry_of {
        println!("Retry Of:    {prior}");
    }
    println!("Created:     {}", record.created_at);
    println!("Updated:     {}", record.updated_at);
    if let Some(done) = record.completed_at {
        println!("Completed:   {done}");
    }
    if let Some(ref result) = record.result {
        println!("Result:      {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref err) = record.error {
        println!(
            "Error:       [{}] {} (after {} attempt(s))",
            err.class, err.message, err.attempts
        );
    }
    Ok(())
}
