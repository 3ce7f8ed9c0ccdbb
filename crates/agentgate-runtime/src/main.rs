//! `agentgate` operator CLI
//!
//! Inspects and maintains the shared state used by agentgate runtimes:
//! resolved configuration, task plans, cross-process locks and instances.

mod cmd;

use std::path::PathBuf;

use agentgate_core::config::load_config;
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::info;

use agentgate_runtime::coordinator::Coordinator;

use cmd::{ConfigAction, InstancesAction, LocksAction, PlanAction};

#[derive(Parser, Debug)]
#[command(name = "agentgate")]
#[command(version, about = "agentgate - admission control and coordination for agent work")]
struct Args {
    /// Project directory whose `.agentgate/settings.json` is layered over the global config
    #[arg(long, env = "AGENTGATE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Shared state directory (overrides `coordinator.state_dir`)
    #[arg(long, env = "AGENTGATE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"). Defaults to `logging.level`.
    #[arg(long, env = "AGENTGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "AGENTGATE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigAction),
    /// Work with task plans
    #[command(subcommand)]
    Plan(PlanAction),
    /// Inspect and clean cross-process locks
    #[command(subcommand)]
    Locks(LocksAction),
    /// Inspect and purge registered instances
    #[command(subcommand)]
    Instances(InstancesAction),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.project_dir.as_deref())?;
    if let Some(dir) = args.state_dir {
        config.coordinator.state_dir = Some(dir);
    }

    let level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    let log_filter = format!("agentgate={level},agentgate_runtime={level},agentgate_core={level}");
    agentgate_core::tracing_init::init_tracing(&log_filter, args.log_json || config.logging.json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting agentgate");

    match args.command {
        Command::Config(action) => cmd::config(&config, &action),
        Command::Plan(action) => cmd::plan(action).await,
        Command::Locks(action) => {
            let coordinator = coordinator(&config)?;
            cmd::locks(&coordinator, action).await
        }
        Command::Instances(action) => {
            let coordinator = coordinator(&config)?;
            cmd::instances(&coordinator, action).await
        }
    }
}

/// A non-registering view of the shared state directory.
fn coordinator(config: &agentgate_core::Config) -> anyhow::Result<Coordinator> {
    let dir = config
        .coordinator
        .resolved_state_dir()
        .context("No state directory: pass --state-dir or set coordinator.state_dir")?;
    Ok(Coordinator::new(dir, config.coordinator.clone()))
}
