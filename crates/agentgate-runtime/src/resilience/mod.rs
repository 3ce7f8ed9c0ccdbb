//! Resilience layer wrapping every remote call.
//!
//! [`Resilience::call`] composes, from the outside in: the per-key circuit
//! breaker, retry with backoff, and the shared throttle gate.

pub mod breaker;
pub mod classify;
pub mod retry;
pub mod throttle;

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use agentgate_core::Config;
use tokio_util::sync::CancellationToken;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerStatus, CircuitOpen};
pub use classify::{Classify, FailureKind, WorkError};
pub use retry::{RetryError, RetryPolicy, retry_with_backoff};
pub use throttle::ThrottleGate;

/// Failure of a call made through [`Resilience::call`].
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    /// Fail-fast rejection; the operation was never invoked.
    #[error("circuit open for {key} (retry in {retry_in:?})")]
    CircuitOpen { key: String, retry_in: Duration },

    #[error("{0}")]
    Failed(RetryError<E>),
}

impl<E> ResilienceError<E> {
    /// The operation's own error, if it ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::Failed(e) => e.into_inner(),
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Failed(RetryError::Cancelled))
    }
}

impl<E> From<CircuitOpen> for ResilienceError<E> {
    fn from(open: CircuitOpen) -> Self {
        Self::CircuitOpen {
            key: open.key,
            retry_in: open.retry_in,
        }
    }
}

/// Breakers, retry policy and throttle state shared by one runtime.
#[derive(Debug)]
pub struct Resilience {
    policy: RetryPolicy,
    breakers: BreakerRegistry,
    throttle: ThrottleGate,
}

impl Resilience {
    pub const fn new(policy: RetryPolicy, breakers: BreakerRegistry, throttle: ThrottleGate) -> Self {
        Self {
            policy,
            breakers,
            throttle,
        }
    }

    /// Build from configuration. With `throttle_path`, throttle windows are
    /// shared with other processes using the same file.
    pub fn from_config(config: &Config, throttle_path: Option<PathBuf>) -> Self {
        let throttle = throttle_path.map_or_else(ThrottleGate::in_memory, ThrottleGate::persistent);
        Self::new(
            RetryPolicy::from(&config.retry),
            BreakerRegistry::from_config(&config.breaker),
            throttle,
        )
    }

    pub const fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub const fn throttle(&self) -> &ThrottleGate {
        &self.throttle
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `operation` for dependency `key` under breaker, retry and throttle.
    ///
    /// The breaker sees one outcome per call (after retries), so a single
    /// flaky request does not trip it. Cancellation is not a failure.
    pub async fn call<T, E, F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let permit = self.breakers.acquire(key)?;
        match retry_with_backoff(key, &self.policy, Some(&self.throttle), cancel, operation).await {
            Ok(value) => {
                permit.succeeded();
                Ok(value)
            }
            Err(RetryError::Cancelled) => {
                drop(permit);
                Err(ResilienceError::Failed(RetryError::Cancelled))
            }
            Err(e) => {
                permit.failed();
                Err(ResilienceError::Failed(e))
            }
        }
    }
}
