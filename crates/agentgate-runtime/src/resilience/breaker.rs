//! Per-dependency circuit breakers.
//!
//! Each dependency key gets its own breaker, created lazily on first use:
//!
//! ```text
//! closed --(threshold consecutive failures)--> open
//! open   --(cooldown elapsed, next call)-----> half-open (single trial)
//! half-open --trial succeeds--> closed
//! half-open --trial fails-----> open (cooldown restarts)
//! ```
//!
//! Callers take a [`BreakerPermit`] before invoking the dependency and settle
//! it with the outcome. A half-open trial permit that is dropped unsettled
//! (e.g. the call was cancelled) counts as a failed trial so the breaker can
//! never get stuck in half-open.

use std::collections::HashMap;
use std::time::Duration;

use agentgate_core::config::BreakerConfig;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker position for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

/// The breaker rejected the call without invoking the dependency.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {key} (retry in {retry_in:?})")]
pub struct CircuitOpen {
    pub key: String,
    /// Time until the next half-open trial may start. Zero while a trial is
    /// already in flight.
    pub retry_in: Duration,
}

#[derive(Debug)]
struct BreakerState {
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    const fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }
}

/// Lazily-populated set of breakers keyed by dependency.
#[derive(Debug)]
pub struct BreakerRegistry {
    failure_threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_millis(config.cooldown_ms))
    }

    /// Ask to call `key`. Fails fast while the breaker is open.
    pub fn acquire(&self, key: &str) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let now = Instant::now();
        let mut breakers = self.breakers.lock();
        let state = breakers
            .entry(key.to_string())
            .or_insert_with(BreakerState::new);

        let trial = match state.status {
            BreakerStatus::Closed => false,
            BreakerStatus::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let ready_at = opened_at + self.cooldown;
                if now < ready_at {
                    return Err(CircuitOpen {
                        key: key.to_string(),
                        retry_in: ready_at - now,
                    });
                }
                info!(key, "Circuit half-open, allowing trial call");
                state.status = BreakerStatus::HalfOpen;
                state.trial_in_flight = true;
                true
            }
            BreakerStatus::HalfOpen => {
                if state.trial_in_flight {
                    return Err(CircuitOpen {
                        key: key.to_string(),
                        retry_in: Duration::ZERO,
                    });
                }
                state.trial_in_flight = true;
                true
            }
        };
        drop(breakers);

        Ok(BreakerPermit {
            registry: self,
            key: key.to_string(),
            trial,
            settled: false,
        })
    }

    /// Current state of `key`, if it has ever been called.
    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        self.breakers.lock().get(key).map(BreakerState::snapshot)
    }

    /// Forget `key`, returning it to closed.
    pub fn reset(&self, key: &str) {
        self.breakers.lock().remove(key);
    }

    fn on_success(&self, key: &str, trial: bool) {
        let mut breakers = self.breakers.lock();
        let Some(state) = breakers.get_mut(key) else {
            return;
        };
        match state.status {
            BreakerStatus::HalfOpen if trial => {
                info!(key, "Trial call succeeded, circuit closed");
                *state = BreakerState::new();
            }
            BreakerStatus::Closed => state.consecutive_failures = 0,
            // Late result of a call admitted before the breaker opened.
            BreakerStatus::Open | BreakerStatus::HalfOpen => {}
        }
    }

    fn on_failure(&self, key: &str, trial: bool) {
        let now = Instant::now();
        let mut breakers = self.breakers.lock();
        let Some(state) = breakers.get_mut(key) else {
            return;
        };
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.status {
            BreakerStatus::HalfOpen if trial => {
                warn!(key, "Trial call failed, circuit re-opened");
                state.status = BreakerStatus::Open;
                state.opened_at = Some(now);
                state.trial_in_flight = false;
            }
            BreakerStatus::Closed if state.consecutive_failures >= self.failure_threshold => {
                warn!(
                    key,
                    failures = state.consecutive_failures,
                    cooldown_ms = self.cooldown.as_millis(),
                    "Circuit opened"
                );
                state.status = BreakerStatus::Open;
                state.opened_at = Some(now);
            }
            _ => {}
        }
    }
}

/// Permission to make one call through a breaker.
///
/// Settle with [`succeeded`](Self::succeeded) or [`failed`](Self::failed).
#[derive(Debug)]
#[must_use = "an unsettled trial permit counts as a failure"]
pub struct BreakerPermit<'a> {
    registry: &'a BreakerRegistry,
    key: String,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the single half-open trial.
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.registry.on_success(&self.key, self.trial);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.registry.on_failure(&self.key, self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.registry.on_failure(&self.key, true);
        }
    }
}
