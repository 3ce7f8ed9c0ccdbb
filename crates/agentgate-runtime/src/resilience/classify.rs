//! Failure classification for wrapped remote calls.
//!
//! The retry loop only needs to know one of three things about an error:
//! retry it with backoff, wait out a rate limit, or give up. Host errors opt
//! in through [`Classify`]; [`WorkError`] is the ready-made carrier for hosts
//! that only have an error message.

use std::time::Duration;

/// How a failure should be handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blips, timeouts, 5xx. Retried with exponential backoff.
    Transient,
    /// The provider is throttling us. Retried on a separate budget,
    /// honouring the provider's hint when present.
    RateLimited { retry_after: Option<Duration> },
    /// Anything else. Propagated immediately.
    Fatal,
}

/// Errors that can tell the retry loop how to treat them.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// Error returned by one unit of agent work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{0}")]
    Fatal(String),
}

impl Classify for WorkError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::RateLimited { retry_after, .. } => FailureKind::RateLimited {
                retry_after: *retry_after,
            },
            Self::Fatal(_) => FailureKind::Fatal,
        }
    }
}

const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "resource_exhausted",
];

const RATE_LIMIT_CODES: &[&str] = &["429"];

const TRANSIENT_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "socket hang up",
    "econnreset",
    "econnrefused",
    "etimedout",
    "eai_again",
    "network error",
    "overloaded",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
];

const TRANSIENT_CODES: &[&str] = &["500", "502", "503", "504", "529"];

impl WorkError {
    /// Classify a raw provider/transport error message.
    pub fn classify_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if contains_any(&lower, RATE_LIMIT_PHRASES) || has_code(&lower, RATE_LIMIT_CODES) {
            let retry_after = parse_retry_after(&lower);
            return Self::RateLimited {
                message,
                retry_after,
            };
        }
        if contains_any(&lower, TRANSIENT_PHRASES) || has_code(&lower, TRANSIENT_CODES) {
            return Self::Transient(message);
        }
        Self::Fatal(message)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Status codes must appear as standalone tokens so `"5000 tokens"` is not a 500.
fn has_code(haystack: &str, codes: &[&str]) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| codes.contains(&token))
}

/// Extract a `retry-after` hint such as `"retry-after: 12"`, `"retry after 1500ms"`
/// or `"retry after 3s"`. Bare numbers are seconds.
fn parse_retry_after(lower: &str) -> Option<Duration> {
    let start = ["retry-after", "retry_after", "retry after"]
        .iter()
        .find_map(|marker| lower.find(marker).map(|i| i + marker.len()))?;
    let rest = lower[start..].trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    let value: u64 = digits.parse().ok()?;
    let unit = &rest[digits.len()..];
    if unit.starts_with("ms") {
        Some(Duration::from_millis(value))
    } else {
        Some(Duration::from_secs(value))
    }
}
