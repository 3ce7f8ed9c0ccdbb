//! Configuration resolution for agentgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/agentgate/settings.json)
//! 3. Project config (.agentgate/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a project file that only sets
//! `limits.max_total_active_requests` keeps every other value from the
//! layers below it. The resolved [`Config`] is immutable for the lifetime of
//! the process.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete agentgate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub limits: RuntimeLimits,
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub coordinator: CoordinatorConfig,
    pub logging: LoggingConfig,
}

/// Static capacity ceilings. Configured at process start; immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    /// Ceiling on active requests plus slot-holding reservations.
    pub max_total_active_requests: u32,
    /// Ceiling on concurrent LLM calls across the process.
    pub max_total_active_llm: u32,
    pub max_parallel_subagents_per_run: u32,
    pub max_parallel_teams_per_run: u32,
    pub max_parallel_teammates_per_team: u32,
    /// How long a rejected admission may keep polling before surfacing "busy".
    pub capacity_wait_ms: u64,
    pub capacity_poll_ms: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_total_active_requests: 8,
            max_total_active_llm: 4,
            max_parallel_subagents_per_run: 4,
            max_parallel_teams_per_run: 2,
            max_parallel_teammates_per_team: 3,
            capacity_wait_ms: 30_000,
            capacity_poll_ms: 100,
        }
    }
}

/// Which per-run parallelism ceiling applies to a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelismScope {
    Subagents,
    Teams,
    Teammates,
}

impl RuntimeLimits {
    pub const fn ceiling(&self, scope: ParallelismScope) -> u32 {
        match scope {
            ParallelismScope::Subagents => self.max_parallel_subagents_per_run,
            ParallelismScope::Teams => self.max_parallel_teams_per_run,
            ParallelismScope::Teammates => self.max_parallel_teammates_per_team,
        }
    }

    /// Clamp a caller-requested fan-out to `[1, ceiling(scope)]`.
    ///
    /// Zero and negative requests become 1.
    pub fn clamp_parallelism(&self, scope: ParallelismScope, requested: i64) -> usize {
        let ceiling = i64::from(self.ceiling(scope).max(1));
        let clamped = requested.clamp(1, ceiling);
        usize::try_from(clamped).unwrap_or(1)
    }

    pub const fn capacity_wait(&self) -> Duration {
        Duration::from_millis(self.capacity_wait_ms)
    }

    pub const fn capacity_poll(&self) -> Duration {
        Duration::from_millis(self.capacity_poll_ms)
    }
}

/// Reservation bookkeeping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Lifetime of a fresh reservation before the sweeper reclaims it.
    pub reservation_ttl_ms: u64,
    /// Sweeper tick.
    pub sweep_interval_ms: u64,
    /// Maximum number of admissions waiting for capacity at once.
    pub max_queue_size: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: 60_000,
            sweep_interval_ms: 5_000,
            max_queue_size: 64,
        }
    }
}

impl AdmissionConfig {
    pub const fn reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.reservation_ttl_ms)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Retry-with-backoff budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries for transient/network failures.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomise transient backoff delays.
    pub jitter: bool,
    /// Retries for rate-limited failures (separate, usually larger budget).
    pub rate_limit_max_retries: u32,
    /// Total time a single call may spend waiting out rate limits.
    pub rate_limit_max_wait_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            rate_limit_max_retries: 8,
            rate_limit_max_wait_ms: 120_000,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a half-open trial.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// Cross-process coordination configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub enabled: bool,
    /// Shared directory holding `locks/` and `instances/`.
    /// Defaults to [`default_state_dir`].
    pub state_dir: Option<PathBuf>,
    pub lock_ttl_ms: u64,
    pub lock_max_retries: u32,
    pub heartbeat_interval_ms: u64,
    /// An instance silent for longer than this is considered dead.
    pub dead_instance_threshold_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: None,
            lock_ttl_ms: 30_000,
            lock_max_retries: 5,
            heartbeat_interval_ms: 10_000,
            dead_instance_threshold_ms: 60_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    /// The configured state directory, or the platform default.
    pub fn resolved_state_dir(&self) -> Option<PathBuf> {
        self.state_dir.clone().or_else(default_state_dir)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject configurations that would make the runtime unable to admit work.
    pub fn validate(&self) -> Result<()> {
        let l = &self.limits;
        for (name, value) in [
            ("limits.max_total_active_requests", l.max_total_active_requests),
            ("limits.max_total_active_llm", l.max_total_active_llm),
            ("limits.max_parallel_subagents_per_run", l.max_parallel_subagents_per_run),
            ("limits.max_parallel_teams_per_run", l.max_parallel_teams_per_run),
            ("limits.max_parallel_teammates_per_team", l.max_parallel_teammates_per_team),
            ("breaker.failure_threshold", self.breaker.failure_threshold),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        if l.capacity_poll_ms == 0 {
            return Err(Error::Config(
                "limits.capacity_poll_ms must be greater than zero".to_string(),
            ));
        }
        if self.admission.reservation_ttl_ms == 0 || self.admission.sweep_interval_ms == 0 {
            return Err(Error::Config(
                "admission.reservation_ttl_ms and admission.sweep_interval_ms must be greater than zero"
                    .to_string(),
            ));
        }
        if self.admission.max_queue_size == 0 {
            return Err(Error::Config(
                "admission.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::Config(
                "retry.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        let c = &self.coordinator;
        if c.lock_ttl_ms == 0 || c.heartbeat_interval_ms == 0 || c.cleanup_interval_ms == 0 {
            return Err(Error::Config(
                "coordinator intervals and lock_ttl_ms must be greater than zero".to_string(),
            ));
        }
        if c.heartbeat_interval_ms >= c.dead_instance_threshold_ms {
            return Err(Error::Config(format!(
                "coordinator.heartbeat_interval_ms ({}) must be below dead_instance_threshold_ms ({})",
                c.heartbeat_interval_ms, c.dead_instance_threshold_ms
            )));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    load_config_from(
        global_config_path().as_deref(),
        project_dir,
        |key| std::env::var(key).ok(),
    )
}

/// Load configuration from explicit sources.
///
/// `env` looks up environment overrides; the binary passes `std::env::var`,
/// tests pass a closure over a map.
pub fn load_config_from(
    global_path: Option<&Path>,
    project_dir: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_path
        && global_path.exists()
    {
        merge_json(&mut merged, load_config_file(global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".agentgate").join("settings.json");
        if project_path.exists() {
            merge_json(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, env)?;
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agentgate").join("settings.json"))
}

/// Default shared state directory for locks and instance records.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join("agentgate"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge per key; every other value
/// replaces what was there.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}")))
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(val) = env("AGENTGATE_MAX_TOTAL_ACTIVE_REQUESTS") {
        config.limits.max_total_active_requests =
            parse_env("AGENTGATE_MAX_TOTAL_ACTIVE_REQUESTS", &val)?;
    }
    if let Some(val) = env("AGENTGATE_MAX_TOTAL_ACTIVE_LLM") {
        config.limits.max_total_active_llm = parse_env("AGENTGATE_MAX_TOTAL_ACTIVE_LLM", &val)?;
    }
    if let Some(val) = env("AGENTGATE_CAPACITY_WAIT_MS") {
        config.limits.capacity_wait_ms = parse_env("AGENTGATE_CAPACITY_WAIT_MS", &val)?;
    }
    if let Some(val) = env("AGENTGATE_CAPACITY_POLL_MS") {
        config.limits.capacity_poll_ms = parse_env("AGENTGATE_CAPACITY_POLL_MS", &val)?;
    }
    if let Some(val) = env("AGENTGATE_COORDINATOR_ENABLED") {
        config.coordinator.enabled = parse_env("AGENTGATE_COORDINATOR_ENABLED", &val)?;
    }
    if let Some(val) = env("AGENTGATE_STATE_DIR") {
        config.coordinator.state_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = env("AGENTGATE_LOG_LEVEL") {
        config.logging.level = val;
    }
    Ok(())
}
