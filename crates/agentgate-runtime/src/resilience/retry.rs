//! Retry with exponential backoff.
//!
//! Transient failures and rate limits are retried on separate budgets; fatal
//! failures are returned on the spot. Rate-limit waits are published to the
//! shared [`ThrottleGate`] so concurrent callers of the same dependency hold
//! off as well.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use agentgate_core::config::RetryConfig;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classify::{Classify, FailureKind};
use super::throttle::ThrottleGate;

/// Retry budgets and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries for transient failures (attempts = retries + 1).
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub rate_limit_max_retries: u32,
    /// Total wait a single call may spend on rate limits.
    pub rate_limit_max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            rate_limit_max_retries: config.rate_limit_max_retries,
            rate_limit_max_wait: Duration::from_millis(config.rate_limit_max_wait_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            rate_limit_max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff for the given retry (0-indexed), capped at `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Backoff with "equal jitter": half fixed, half random.
    fn transient_delay(&self, retry: u32) -> Duration {
        let delay = self.backoff_delay(retry);
        if self.jitter {
            let half = delay / 2;
            half + half.mul_f64(rand::rng().random_range(0.0..1.0))
        } else {
            delay
        }
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure: {error}")]
    Fatal { error: E },

    #[error("gave up after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("rate limit budget exhausted after {attempts} attempts ({waited:?} waited): {error}")]
    RateLimitExhausted {
        attempts: u32,
        waited: Duration,
        error: E,
    },

    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The last error returned by the operation, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Fatal { error }
            | Self::Exhausted { error, .. }
            | Self::RateLimitExhausted { error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

async fn sleep_or_cancel<E>(delay: Duration, cancel: &CancellationToken) -> Result<(), RetryError<E>> {
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        () = cancel.cancelled() => Err(RetryError::Cancelled),
    }
}

/// Run `operation` until it succeeds, fails fatally, or exhausts a budget.
///
/// `operation` receives the 1-based attempt number. When `throttle` is given,
/// every attempt first waits for the shared window of `key`, and rate-limit
/// waits are published there instead of slept locally.
pub async fn retry_with_backoff<T, E, F, Fut>(
    key: &str,
    policy: &RetryPolicy,
    throttle: Option<&ThrottleGate>,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let mut attempts = 0u32;
    let mut transient_retries = 0u32;
    let mut rate_limit_retries = 0u32;
    let mut rate_limit_waited = Duration::ZERO;

    loop {
        if let Some(gate) = throttle {
            gate.wait_turn(key, cancel)
                .await
                .map_err(|_| RetryError::Cancelled)?;
        }
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        attempts += 1;
        let error = match operation(attempts).await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(key, attempts, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        match error.failure_kind() {
            FailureKind::Fatal => {
                debug!(key, attempts, error = %error, "Non-retryable failure");
                return Err(RetryError::Fatal { error });
            }
            FailureKind::Transient => {
                if transient_retries >= policy.max_retries {
                    warn!(key, attempts, error = %error, "Transient failure, retries exhausted");
                    return Err(RetryError::Exhausted { attempts, error });
                }
                let delay = policy.transient_delay(transient_retries);
                transient_retries += 1;
                warn!(
                    key,
                    attempts,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Transient failure, retrying"
                );
                sleep_or_cancel(delay, cancel).await?;
            }
            FailureKind::RateLimited { retry_after } => {
                let delay = retry_after.unwrap_or_else(|| policy.backoff_delay(rate_limit_retries));
                if rate_limit_retries >= policy.rate_limit_max_retries
                    || rate_limit_waited + delay > policy.rate_limit_max_wait
                {
                    warn!(
                        key,
                        attempts,
                        waited_ms = rate_limit_waited.as_millis(),
                        error = %error,
                        "Rate limited, budget exhausted"
                    );
                    return Err(RetryError::RateLimitExhausted {
                        attempts,
                        waited: rate_limit_waited,
                        error,
                    });
                }
                rate_limit_retries += 1;
                rate_limit_waited += delay;
                warn!(
                    key,
                    attempts,
                    delay_ms = delay.as_millis(),
                    hinted = retry_after.is_some(),
                    "Rate limited, backing off"
                );
                match throttle {
                    Some(gate) => gate.defer(key, delay).await,
                    None => sleep_or_cancel(delay, cancel).await?,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resilience::classify::WorkError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
            rate_limit_max_retries: 5,
            rate_limit_max_wait: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = fast_policy();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..fast_policy()
        };
        for _ in 0..100 {
            let d = policy.transient_delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_with_backoff(
            "llm",
            &fast_policy(),
            None,
            &CancellationToken::new(),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(WorkError::Transient("reset".into()))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(
            "llm",
            &fast_policy(),
            None,
            &CancellationToken::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkError::Transient("timeout".into())) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = retry_with_backoff(
            "llm",
            &fast_policy(),
            None,
            &CancellationToken::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkError::Fatal("bad request".into())) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Fatal { .. }));
        assert_eq!(err.into_inner(), Some(WorkError::Fatal("bad request".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_honours_retry_after_hint() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();
        let result = retry_with_backoff(
            "llm",
            &fast_policy(),
            None,
            &CancellationToken::new(),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(WorkError::RateLimited {
                            message: "429".into(),
                            retry_after: Some(Duration::from_secs(3)),
                        })
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        // The hint overrides max_delay (1s).
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_total_wait_is_bounded() {
        let policy = RetryPolicy {
            rate_limit_max_wait: Duration::from_secs(5),
            ..fast_policy()
        };
        let result: Result<(), _> = retry_with_backoff(
            "llm",
            &policy,
            None,
            &CancellationToken::new(),
            |_| async {
                Err(WorkError::RateLimited {
                    message: "slow down".into(),
                    retry_after: Some(Duration::from_secs(2)),
                })
            },
        )
        .await;

        match result {
            Err(RetryError::RateLimitExhausted {
                attempts, waited, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(waited, Duration::from_secs(4));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_publishes_to_shared_gate() {
        let gate = ThrottleGate::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();
        let result = retry_with_backoff(
            "llm",
            &fast_policy(),
            Some(&gate),
            &CancellationToken::new(),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(WorkError::RateLimited {
                            message: "429".into(),
                            retry_after: Some(Duration::from_secs(3)),
                        })
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The wait went through the gate, not a local sleep.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(gate.remaining("llm").await, Duration::ZERO);

        gate.defer("llm", Duration::from_secs(1)).await;
        assert!(gate.remaining("llm").await > Duration::ZERO);
        assert_eq!(gate.remaining("other").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result: Result<(), _> = retry_with_backoff(
            "llm",
            &fast_policy(),
            None,
            &cancel,
            move |_| {
                trigger.cancel();
                async { Err(WorkError::Transient("timeout".into())) }
            },
        )
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
