use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dataset_hub::app::AppContext;
use dataset_hub::config::{Overrides, Settings};
use dataset_hub::context::{RequestContext, RequestTracker};
use dataset_hub::executor::{AsyncTaskService, TaskParams, TaskResult};
use dataset_hub::tasks::{ValidationKind, submit_file_validation, submit_revision};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dataset-hub", version)]
#[command(about = "Task worker and operator commands for the dataset hub")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "HUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the configured queues until Ctrl+C.
    Worker,
    /// Run the ping task and print its reply.
    Ping {
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Register a repository dataset and print its new accession.
    Assign {
        #[arg(long, default_value = "mhd")]
        prefix: String,
        #[arg(long)]
        repository: String,
        #[arg(long)]
        dataset_id: String,
    },
    /// Submit an announcement file as the next revision of a dataset.
    Submit {
        #[arg(long)]
        repository: String,
        #[arg(long)]
        accession: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Validate a dataset file (or an announcement file).
    Validate {
        #[arg(long)]
        repository: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        announcement: bool,
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
    },
    /// Print the current state of a task.
    Status { task_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply(&cli.overrides);
    dataset_hub::logging::init(&settings.logging.level);

    // 1. Collaborators, registry and executor backend:
    let ctx = AppContext::build(settings).await?;

    // 2. Commands:
    let context = RequestContext::default()
        .with_client("cli")
        .with_correlation_id(uuid::Uuid::new_v4().to_string());
    let result = RequestTracker::scope(context, run(&ctx, cli.command)).await;

    ctx.shutdown().await;
    result
}

async fn run(ctx: &AppContext, command: Command) -> Result<()> {
    if !matches!(command, Command::Worker) && ctx.needs_local_workers() {
        ctx.start_workers();
    }

    match command {
        Command::Worker => run_worker(ctx).await,
        Command::Ping { wait_secs } => {
            let result = ctx
                .service
                .get_executor(&ctx.catalog.ping, None, TaskParams::new())?
                .start(None)
                .await?;
            print_outcome(&result, wait_secs).await
        }
        Command::Assign {
            prefix,
            repository,
            dataset_id,
        } => {
            let dataset = ctx
                .identifiers
                .assign_dataset(&prefix, &repository, &dataset_id)
                .await?;
            print_json(&dataset)
        }
        Command::Submit {
            repository,
            accession,
            file,
            reason,
            wait_secs,
        } => {
            let submission = submit_revision(
                &ctx.service,
                &ctx.lock,
                &ctx.catalog,
                &repository,
                &accession,
                read_json(&file)?,
                &reason,
            )
            .await?;
            tracing::info!("Submitted as task {}", submission.task_id);
            let result = ctx.service.get_result(&submission.task_id).await?;
            print_outcome(&result, wait_secs).await
        }
        Command::Validate {
            repository,
            file,
            announcement,
            wait_secs,
        } => {
            let kind = if announcement {
                ValidationKind::Announcement
            } else {
                ValidationKind::DatasetFile
            };
            let filename = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let submission = submit_file_validation(
                &ctx.service,
                &ctx.lock,
                &ctx.catalog,
                kind,
                &repository,
                &filename,
                read_json(&file)?,
            )
            .await?;
            let result = ctx.service.get_result(&submission.task_id).await?;
            print_outcome(&result, wait_secs).await
        }
        Command::Status { task_id } => {
            let result = ctx.service.get_result(&task_id).await?;
            print_json(&result.summary().await?)
        }
    }
}

async fn run_worker(ctx: &AppContext) -> Result<()> {
    let Some(pool) = ctx.start_workers() else {
        anyhow::bail!("the thread backend runs tasks in the submitting process, no worker needed");
    };

    // Stats reporter:
    let stats_cache = ctx.cache.clone();
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let reachable = stats_cache.ping().await.unwrap_or(false);
            tracing::info!("Worker alive, cache reachable: {}", reachable);
        }
    });

    tracing::info!(
        "Worker pool running with {} workers. Press Ctrl+C to shutdown",
        pool.options().concurrency
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    reporter.abort();
    tracing::info!("Shutting down");
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

async fn print_outcome(result: &TaskResult, wait_secs: u64) -> Result<()> {
    let outcome = result
        .outcome::<Value>(Some(Duration::from_secs(wait_secs)))
        .await;
    print_json(&outcome)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
