//! Operator subcommands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::PathBuf;

use agentgate_core::Config;
use anyhow::Context as _;
use clap::Subcommand;

use agentgate_runtime::coordinator::Coordinator;
use agentgate_runtime::dag::TaskPlan;
use agentgate_runtime::persist::epoch_ms_now;

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the resolved configuration as JSON
    Show,
}

#[derive(Subcommand, Debug)]
pub enum PlanAction {
    /// Validate a plan file and print its execution batches
    Validate {
        /// Path to the plan JSON file
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum LocksAction {
    /// List lock files in the state directory
    List,
    /// Remove expired and corrupt lock files
    Cleanup,
}

#[derive(Subcommand, Debug)]
pub enum InstancesAction {
    /// List registered instances
    List,
    /// Remove instances whose heartbeat is older than the dead-instance threshold
    Purge,
}

pub fn config(config: &Config, action: &ConfigAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        ConfigAction::Show => {
            writeln!(out, "{}", serde_json::to_string_pretty(config)?)?;
        }
    }
    Ok(())
}

pub async fn plan(action: PlanAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        PlanAction::Validate { file } => {
            let plan = TaskPlan::load(&file)
                .await
                .with_context(|| format!("Failed to load plan {}", file.display()))?;
            let batches = plan.batches()?;
            writeln!(out, "Plan is valid: {} tasks in {} batches", plan.len(), batches.len())?;
            for (i, batch) in batches.iter().enumerate() {
                writeln!(out, "  batch {}: {}", i + 1, batch.join(", "))?;
            }
        }
    }
    Ok(())
}

pub async fn locks(coordinator: &Coordinator, action: LocksAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        LocksAction::List => {
            let locks = coordinator.list_locks().await?;
            if locks.is_empty() {
                writeln!(out, "No locks held.")?;
                return Ok(());
            }
            let now = epoch_ms_now();
            writeln!(out, "{:<32}  {:<36}  {:>12}", "RESOURCE", "OWNER", "EXPIRES IN")?;
            for lock in &locks {
                let expires = if lock.is_expired_at(now) {
                    "expired".to_string()
                } else {
                    format!("{}ms", lock.expires_at - now)
                };
                writeln!(
                    out,
                    "{:<32}  {:<36}  {:>12}",
                    truncate(&lock.resource, 32),
                    lock.owner_instance_id,
                    expires
                )?;
            }
        }
        LocksAction::Cleanup => {
            let report = coordinator.cleanup_expired_locks().await?;
            writeln!(
                out,
                "Removed {} expired and {} corrupt lock files.",
                report.removed.len(),
                report.corrupted
            )?;
            for resource in &report.removed {
                writeln!(out, "  {resource}")?;
            }
        }
    }
    Ok(())
}

pub async fn instances(coordinator: &Coordinator, action: InstancesAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        InstancesAction::List => {
            let instances = coordinator.list_instances().await?;
            if instances.is_empty() {
                writeln!(out, "No instances registered.")?;
                return Ok(());
            }
            let now = epoch_ms_now();
            let threshold = coordinator.config().dead_instance_threshold_ms;
            writeln!(out, "{:<36}  {:>8}  {:>14}  {:<5}", "INSTANCE", "PID", "HEARTBEAT AGO", "ALIVE")?;
            for instance in &instances {
                writeln!(
                    out,
                    "{:<36}  {:>8}  {:>14}  {:<5}",
                    instance.instance_id,
                    instance.pid,
                    format!("{}ms", now.saturating_sub(instance.last_heartbeat)),
                    if instance.is_dead_at(now, threshold) { "no" } else { "yes" }
                )?;
            }
        }
        InstancesAction::Purge => {
            let purged = coordinator.purge_dead_instances().await?;
            writeln!(out, "Purged {} dead instances.", purged.len())?;
            for id in &purged {
                writeln!(out, "  {id}")?;
            }
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
