use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use foreman::gate::Outcome;
use foreman::init::{ORCHESTRATOR_DIR, is_initialized};
use foreman::mode::Mode;
use foreman::retry::FailureKind;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Dependency-ordered dispatch of autonomous workers")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .orchestrator directory
    Init {
        /// Requirements document recorded in foreman.toml
        #[arg(long)]
        requirements: Option<PathBuf>,
        /// External test plan recorded in foreman.toml
        #[arg(long)]
        test_plan: Option<PathBuf>,
    },
    /// Decompose the next loop into a task batch
    Plan {
        /// Force a mode: initial, improvement_loop, critical_only, external_spec
        #[arg(long)]
        mode: Option<Mode>,
        #[arg(long)]
        requirements: Option<PathBuf>,
        #[arg(long)]
        test_plan: Option<PathBuf>,
    },
    /// Dispatch a loop until it settles
    Run {
        /// Loop to run (defaults to the latest)
        #[arg(long = "loop")]
        loop_number: Option<u32>,
        /// Worker command, overriding foreman.toml
        #[arg(long, env = "FOREMAN_WORKER_CMD")]
        worker_cmd: Option<String>,
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Show task status for a loop
    Status {
        #[arg(long = "loop")]
        loop_number: Option<u32>,
        /// Print the task store as JSON
        #[arg(long)]
        json: bool,
    },
    /// List tasks whose dependencies are all done
    Ready {
        #[arg(long = "loop")]
        loop_number: Option<u32>,
    },
    /// Print a loop's task queue, or import an edited one as a new loop
    Queue {
        #[arg(long = "loop")]
        loop_number: Option<u32>,
        #[arg(long)]
        import: Option<PathBuf>,
    },
    /// Publish a completion marker (worker side)
    Publish {
        #[arg(long)]
        task: String,
        #[arg(long = "loop")]
        loop_number: u32,
        #[arg(long)]
        dispatch: u32,
        /// success or failure
        #[arg(long)]
        outcome: Outcome,
        /// Failure report JSON file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Failure kind for a minimal report
        #[arg(long)]
        kind: Option<FailureKind>,
        /// Primary error for a minimal report
        #[arg(long)]
        error: Option<String>,
    },
    /// Inspect and triage remediation issues
    Issues {
        #[command(subcommand)]
        command: Option<IssuesCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum IssuesCommands {
    /// List issues (completed and superseded ones only with --all)
    List {
        #[arg(long)]
        all: bool,
    },
    /// Show an issue with its signature history
    Show { id: String },
    /// Accept a pending issue for the next cycle
    Accept { id: String },
    /// Clear a halt after manual intervention
    Reopen { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

/// Install the stderr layer, plus a daily log file once the project is
/// initialized. The guard must outlive the run.
fn init_tracing(project_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let default_level = if verbose { "foreman=debug" } else { "foreman=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if is_initialized(project_dir) {
        let log_dir = project_dir.join(ORCHESTRATOR_DIR).join("logs");
        let appender = tracing_appender::rolling::daily(log_dir, "foreman.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .json();
        let file_filter = EnvFilter::new("foreman=debug");
        let _ = tracing_subscriber::registry()
            .with(stderr_layer.with_filter(filter))
            .with(file_layer.with_filter(file_filter))
            .try_init();
        Some(guard)
    } else {
        let _ = tracing_subscriber::registry()
            .with(stderr_layer.with_filter(filter))
            .try_init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = init_tracing(&project_dir, cli.verbose);

    match cli.command {
        Commands::Init {
            requirements,
            test_plan,
        } => cmd::cmd_init(&project_dir, requirements.as_deref(), test_plan.as_deref())?,
        Commands::Plan {
            mode,
            requirements,
            test_plan,
        } => cmd::cmd_plan(&project_dir, mode, requirements, test_plan)?,
        Commands::Run {
            loop_number,
            worker_cmd,
            max_parallel,
        } => {
            cmd::cmd_run(&project_dir, loop_number, worker_cmd, max_parallel, cli.verbose).await?
        }
        Commands::Status { loop_number, json } => cmd::cmd_status(&project_dir, loop_number, json)?,
        Commands::Ready { loop_number } => cmd::cmd_ready(&project_dir, loop_number)?,
        Commands::Queue {
            loop_number,
            import,
        } => cmd::cmd_queue(&project_dir, loop_number, import)?,
        Commands::Publish {
            task,
            loop_number,
            dispatch,
            outcome,
            report,
            kind,
            error,
        } => cmd::cmd_publish(
            &project_dir,
            cmd::publish::PublishArgs {
                task,
                loop_number,
                dispatch,
                outcome,
                report,
                kind,
                error,
            },
        )?,
        Commands::Issues { command } => cmd::cmd_issues(&project_dir, command)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
