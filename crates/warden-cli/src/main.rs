//! warden - sandboxed task-execution worker for AI-generated code
//! modifications.
//!
//! Polls a filesystem task queue, runs each task's executor and
//! verification commands inside a hardened container, scans all output
//! for leaked secrets, and writes one durable result per task.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use warden_core::config::WorkerConfig;

mod commands;
mod exit_codes;

/// warden - sandboxed task-execution worker
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the worker configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Handoff root override
    #[arg(long)]
    handoff_root: Option<PathBuf>,

    /// Target repository override
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the task-processing worker
    Worker {
        /// Process the queue once and exit instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Create the handoff directory skeleton
    Init,

    /// Validate a task file and enqueue it
    Submit {
        /// Path to a task JSON file
        file: PathBuf,
    },

    /// List pending, running, and completed tasks
    Queue,

    /// Print one task's result record
    Result {
        /// Task id
        id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(exit_codes::GENERIC_ERROR);
        },
    };
    if let Some(handoff_root) = cli.handoff_root {
        config.handoff_root = handoff_root;
    }
    if let Some(repo_root) = cli.repo_root {
        config.repo_root = repo_root;
    }

    let outcome = match cli.command {
        Commands::Worker { once } => commands::worker::run(&config, once),
        Commands::Init => commands::queue::run_init(&config).map(|()| exit_codes::OK),
        Commands::Submit { file } => {
            commands::queue::run_submit(&config, &file).map(|()| exit_codes::OK)
        },
        Commands::Queue => commands::queue::run_queue(&config).map(|()| exit_codes::OK),
        Commands::Result { id } => {
            commands::queue::run_result(&config, &id).map(|()| exit_codes::OK)
        },
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_codes::GENERIC_ERROR)
        },
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<WorkerConfig> {
    if let Some(path) = explicit {
        return Ok(WorkerConfig::load(path)?);
    }
    let default_path = std::path::Path::new("warden.toml");
    if default_path.exists() {
        return Ok(WorkerConfig::load(default_path)?);
    }
    Ok(WorkerConfig::default())
}
