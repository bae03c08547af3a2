//! CLI command definitions for recon-forge.
//!
//! Every command builds its configuration from `RECON_*` environment
//! variables first, then applies the global flags on top.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::events::{sse, EventNotifier, NoDependents, Notification};
use crate::metrics::{export_metrics, init_metrics, FailureCause};
use crate::orchestrator::{CancelOutcome, Orchestrator, OPERATOR_CANCEL_REASON};
use crate::pipeline::{OrchestratorConfig, Transitions};
use crate::stage::StageKind;
use crate::storage::{SqliteTaskStore, TaskFilter, TaskStore};
use crate::task::{TaskId, TaskLayout, TaskStatus};

/// GPU-exclusive reconstruction task orchestrator.
#[derive(Parser)]
#[command(name = "recon-forge")]
#[command(about = "Run frame extraction, structure recovery and training as managed tasks")]
#[command(version)]
#[command(
    long_about = "recon-forge turns uploaded media into trained reconstructions.\n\nEach task runs frame extraction, structure recovery and model training as supervised process trees, one GPU slot at a time.\n\nExample usage:\n  recon-forge run --input uploads/clip.mp4 --variant 3dgs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite URL of the task store (overrides RECON_DATABASE_URL).
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Root directory for task working directories (overrides RECON_WORK_ROOT).
    #[arg(long, global = true)]
    pub work_root: Option<PathBuf>,

    /// YAML file with additional variants (overrides RECON_VARIANTS_FILE).
    #[arg(long, global = true)]
    pub variants_file: Option<PathBuf>,

    /// Number of concurrent GPU slots (overrides RECON_SLOTS).
    #[arg(long, global = true)]
    pub slots: Option<usize>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit inputs and follow them until they finish.
    Run(RunArgs),

    /// Show the status of one task as JSON.
    Status(StatusArgs),

    /// List tasks as JSON.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Cancel a task.
    Cancel(CancelArgs),

    /// Register an existing output directory as a trained task.
    Adopt(AdoptArgs),

    /// List configured algorithm variants.
    Variants(VariantsArgs),
}

/// Arguments for `recon-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input media references (file paths).
    #[arg(short, long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<String>,

    /// Algorithm variant (defaults to RECON_DEFAULT_VARIANT or 3dgs).
    #[arg(short, long)]
    pub variant: Option<String>,

    /// Print Prometheus metrics when all tasks have finished.
    #[arg(long)]
    pub print_metrics: bool,

    /// Print events as server-sent-event frames instead of log lines.
    #[arg(long)]
    pub sse: bool,
}

/// Arguments for `recon-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task identifier.
    pub task_id: TaskId,
}

/// Arguments for `recon-forge list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only tasks in this status.
    #[arg(short, long)]
    pub status: Option<TaskStatus>,

    /// Only tasks of this variant.
    #[arg(short, long)]
    pub variant: Option<String>,

    /// Only tasks for this input reference.
    #[arg(short, long)]
    pub input: Option<String>,

    /// Maximum number of tasks to print.
    #[arg(long)]
    pub limit: Option<i64>,
}

/// Arguments for `recon-forge cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Task identifier.
    pub task_id: TaskId,
}

/// Arguments for `recon-forge adopt`.
#[derive(Parser, Debug)]
pub struct AdoptArgs {
    /// Input media reference the directory was produced from.
    #[arg(short, long)]
    pub input: String,

    /// Directory holding the finished reconstruction.
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Algorithm variant (defaults to RECON_DEFAULT_VARIANT or 3dgs).
    #[arg(short, long)]
    pub variant: Option<String>,
}

/// Arguments for `recon-forge variants`.
#[derive(Parser, Debug)]
pub struct VariantsArgs {
    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;
    match cli.command {
        Commands::Run(args) => run_run_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::List(args) => run_list_command(config, args).await,
        Commands::Cancel(args) => run_cancel_command(config, args).await,
        Commands::Adopt(args) => run_adopt_command(config, args).await,
        Commands::Variants(args) => run_variants_command(config, args),
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::from_env().context("invalid RECON_* environment")?;
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url.clone());
    }
    if let Some(root) = &cli.work_root {
        config = config.with_work_root(root.clone());
    }
    if let Some(path) = &cli.variants_file {
        config = config.with_variants_file(path.clone());
    }
    if let Some(slots) = cli.slots {
        config = config.with_slots(slots);
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// run
// ============================================================================

async fn run_run_command(config: OrchestratorConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let orchestrator = Orchestrator::open(config).await?;
    let recovery = orchestrator.recover().await?;
    if !recovery.interrupted.is_empty() {
        warn!(
            interrupted = recovery.interrupted.len(),
            "Failed tasks left running by a previous process"
        );
    }

    // Subscribe first so no transition of a new task is missed
    let mut subscription = orchestrator.subscribe();
    let mut waiting = HashSet::new();
    let mut submitted = Vec::new();

    for input in &args.inputs {
        let task = orchestrator
            .submit(input, args.variant.as_deref())
            .await
            .with_context(|| format!("failed to submit {}", input))?;
        info!(
            task_id = %task.id,
            input = %input,
            status = %task.status,
            workdir = %task.working_dir.display(),
            "Submitted"
        );
        if !task.status.is_terminal() {
            waiting.insert(task.id);
        }
        submitted.push(task.id);
    }

    let mut interrupted = false;
    while !waiting.is_empty() {
        tokio::select! {
            notification = subscription.recv() => {
                let Some(notification) = notification else {
                    anyhow::bail!("event stream closed unexpectedly");
                };
                if args.sse {
                    print!("{}", sse::frame(&notification));
                }
                if let Notification::Task(event) = notification {
                    if !waiting.contains(&event.task_id) {
                        continue;
                    }
                    if !args.sse {
                        info!(
                            task_id = %event.task_id,
                            status = %event.status,
                            result_ref = ?event.result_ref,
                            "Status changed"
                        );
                    }
                    if event.status.is_terminal() {
                        waiting.remove(&event.task_id);
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(tasks = waiting.len(), "Interrupted; cancelling unfinished tasks");
                for task_id in waiting.iter().copied().collect::<Vec<_>>() {
                    match orchestrator.cancel(task_id).await {
                        Ok(outcome) => info!(task_id = %task_id, outcome = ?outcome, "Cancel"),
                        Err(e) => warn!(task_id = %task_id, error = %e, "Cancel failed"),
                    }
                }
            }
        }
    }
    orchestrator.unsubscribe(subscription.id());

    let mut summary = Vec::with_capacity(submitted.len());
    for task_id in submitted {
        summary.push(orchestrator.task(task_id).await?);
    }
    orchestrator.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if args.print_metrics {
        println!("{}", export_metrics());
    }

    let failed = summary
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} task(s) failed", failed, summary.len());
    }
    Ok(())
}

// ============================================================================
// status / list
// ============================================================================

async fn run_status_command(config: OrchestratorConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = SqliteTaskStore::connect(&config.database_url).await?;
    let task = store
        .get(args.task_id)
        .await?
        .with_context(|| format!("task {} not found", args.task_id))?;
    println!("{}", serde_json::to_string_pretty(&task.view())?);
    Ok(())
}

async fn run_list_command(config: OrchestratorConfig, args: ListArgs) -> anyhow::Result<()> {
    let store = SqliteTaskStore::connect(&config.database_url).await?;
    let tasks = store.list(&list_filter(&args)).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}

fn list_filter(args: &ListArgs) -> TaskFilter {
    let mut filter = TaskFilter::new();
    if let Some(status) = args.status {
        filter = filter.with_status(status);
    }
    if let Some(variant) = &args.variant {
        filter = filter.with_variant(variant.clone());
    }
    if let Some(input) = &args.input {
        filter = filter.with_artifact_ref(input.clone());
    }
    if let Some(limit) = args.limit {
        filter = filter.with_limit(limit);
    }
    filter
}

// ============================================================================
// cancel
// ============================================================================

/// Persists `failed` for the task. A running orchestrator notices it through
/// its status watcher, stops the process tree and removes the directory.
async fn run_cancel_command(config: OrchestratorConfig, args: CancelArgs) -> anyhow::Result<()> {
    let store: Arc<dyn TaskStore> =
        Arc::new(SqliteTaskStore::connect(&config.database_url).await?);
    let retry = config.retry_policy();
    let notifier = EventNotifier::spawn(config.subscriber_buffer, Arc::new(NoDependents), retry);
    let transitions = Transitions::new(Arc::clone(&store), notifier, retry);

    let task = store
        .get(args.task_id)
        .await?
        .with_context(|| format!("task {} not found", args.task_id))?;

    let outcome = match transitions
        .fail_current(task.id, FailureCause::Cancelled, OPERATOR_CANCEL_REASON)
        .await?
    {
        Some(previous) => {
            // Nothing runs for a queued task, so nobody else cleans up
            if previous.status == TaskStatus::Queued {
                if let Err(e) = TaskLayout::new(&previous.working_dir).remove() {
                    warn!(task_id = %task.id, error = %e, "Failed to remove working directory");
                }
            }
            CancelOutcome::Cancelled {
                previous: previous.status,
                killed_groups: 0,
            }
        }
        None => {
            let status = store.get(task.id).await?.map_or(task.status, |t| t.status);
            CancelOutcome::AlreadyTerminal { status }
        }
    };

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

// ============================================================================
// adopt / variants
// ============================================================================

async fn run_adopt_command(config: OrchestratorConfig, args: AdoptArgs) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::open(config).await?;
    let task = orchestrator
        .adopt(&args.input, args.variant.as_deref(), &args.dir)
        .await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct VariantSummary<'a> {
    name: &'a str,
    description: Option<&'a str>,
    stages: Vec<&'static str>,
    artifact: &'a str,
    default: bool,
}

fn run_variants_command(config: OrchestratorConfig, args: VariantsArgs) -> anyhow::Result<()> {
    let registry = config.load_variants()?;
    let summaries: Vec<VariantSummary<'_>> = registry
        .iter()
        .map(|(name, spec)| VariantSummary {
            name,
            description: spec.description.as_deref(),
            stages: StageKind::ALL
                .iter()
                .filter(|stage| spec.command(**stage).is_some())
                .map(|stage| stage.as_str())
                .collect(),
            artifact: &spec.artifact,
            default: name == config.default_variant,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    for summary in summaries {
        let marker = if summary.default { "*" } else { " " };
        println!(
            "{} {:<12} {:<24} {}",
            marker,
            summary.name,
            summary.stages.join(","),
            summary.description.unwrap_or("")
        );
    }
    Ok(())
}
