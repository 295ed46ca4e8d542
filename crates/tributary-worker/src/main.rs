//! tributary-worker: task worker process and operator commands.
//!
//! `tributary-worker run` (the default) consumes the task queue and runs the
//! periodic sweeps until Ctrl-C. The other subcommands enqueue work or print
//! queue and batch state as JSON.

mod services;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use tributary_core::{defaults, CreateSourceRequest, SourceRepository, TaskQueue};
use tributary_jobs::start_repo_sync;

use services::Services;

#[derive(Parser)]
#[command(name = "tributary-worker")]
#[command(author, version, about = "Content ingestion worker for tributary")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process tasks and run the periodic sweeps until interrupted
    Run,

    /// Register a feed source and queue its first refresh
    AddSource {
        /// Feed URL
        #[arg(short, long)]
        url: String,

        /// Display title
        #[arg(short, long)]
        title: Option<String>,

        /// Minutes between successful refreshes
        #[arg(short, long)]
        interval_minutes: Option<i32>,
    },

    /// Queue a refresh of one source
    Refresh {
        /// Source id
        id: Uuid,

        /// Run now, even when the source is parked in error
        #[arg(short, long)]
        force: bool,
    },

    /// Sync the starred repositories of a GitHub account
    SyncStars {
        /// GitHub account name
        account: String,
    },

    /// Show the progress of a repository sync batch
    Batch {
        /// Batch id
        id: Uuid,
    },

    /// List dead-lettered tasks
    DeadLetters {
        /// Maximum number of tasks to show
        #[arg(short, long, default_value_t = defaults::DEAD_LETTER_PAGE_LIMIT)]
        limit: i64,
    },

    /// Show queue counts by status
    Stats,
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging with daily rotation)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: info for every tributary crate)
fn init_logging() -> Option<WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "tributary_worker=info,tributary_jobs=info,tributary_db=info,tributary_inference=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tributary-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(services: Services) -> anyhow::Result<()> {
    if !services.worker_enabled() {
        info!("Task worker disabled (TASK_WORKER_ENABLED=false)");
    }
    let worker = services.worker().await;
    let handle = worker.start();
    let beat = services.beat().start();
    info!("Worker started, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight tasks");

    beat.shutdown().await;
    handle.shutdown().await?;
    handle.join().await?;
    info!("Worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_logging();

    let services = Services::connect().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(services).await?,
        Commands::AddSource {
            url,
            title,
            interval_minutes,
        } => {
            let id = services
                .db
                .sources
                .create(CreateSourceRequest {
                    url,
                    title,
                    refresh_interval_minutes: interval_minutes,
                })
                .await?;
            let receipt = services.scheduler.schedule(id, false).await?;
            print_json(&serde_json::json!({ "source_id": id, "schedule": receipt }))?;
        }
        Commands::Refresh { id, force } => {
            let receipt = services.scheduler.schedule(id, force).await?;
            print_json(&receipt)?;
        }
        Commands::SyncStars { account } => {
            let (batch_id, task_id) =
                start_repo_sync(&services.batches, services.queue.as_ref(), &account).await?;
            print_json(&serde_json::json!({ "batch_id": batch_id, "task_id": task_id }))?;
        }
        Commands::Batch { id } => match services.batches.progress(id).await? {
            Some(progress) => print_json(&progress)?,
            None => anyhow::bail!("batch {id} not found or expired"),
        },
        Commands::DeadLetters { limit } => {
            let dead = services.queue.list_dead(limit).await?;
            print_json(&dead)?;
        }
        Commands::Stats => {
            let stats = services.queue.stats().await?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
