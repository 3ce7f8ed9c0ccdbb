//! Shared "earliest next allowed call" state per dependency.
//!
//! When one caller is told to back off by a provider, every other caller of
//! the same dependency should wait too instead of burning its own retry budget
//! against a target that is already throttled. [`ThrottleGate`] records a
//! not-before instant per key. With a backing file the deadlines are also
//! visible to other processes sharing the state directory.
//!
//! The state is loaded lazily on first use through a [`OnceCell`]: the first
//! caller performs the load and concurrent callers await that same
//! initialisation. Later checks of a persistent gate fold in deadlines other
//! processes have written since, keeping the later deadline per key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::persist::{duration_ms, epoch_ms_now, write_json_atomic};

/// Per-key not-before deadlines, optionally persisted.
#[derive(Debug, Default)]
pub struct ThrottleGate {
    path: Option<PathBuf>,
    state: OnceCell<Mutex<HashMap<String, Instant>>>,
    loads: AtomicU32,
}

/// The caller's cancellation token fired while waiting for the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting for throttle")]
pub struct ThrottleCancelled;

impl ThrottleGate {
    /// Process-local gate.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Gate persisted to `path` (JSON map of key to epoch milliseconds).
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    async fn state(&self) -> &Mutex<HashMap<String, Instant>> {
        self.state
            .get_or_init(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                let loaded = match &self.path {
                    Some(path) => load_deadlines(path).await,
                    None => HashMap::new(),
                };
                debug!(keys = loaded.len(), "Throttle state loaded");
                Mutex::new(loaded)
            })
            .await
    }

    /// Number of times the initial state load ran (at most one).
    pub fn load_count(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Merge deadlines persisted by other processes into `state`.
    async fn refresh(&self, state: &Mutex<HashMap<String, Instant>>) {
        let Some(path) = &self.path else {
            return;
        };
        let on_disk = load_deadlines(path).await;
        let mut state = state.lock();
        for (key, deadline) in on_disk {
            let entry = state.entry(key).or_insert(deadline);
            if *entry < deadline {
                *entry = deadline;
            }
        }
    }

    /// Time left before `key` may be called again.
    pub async fn remaining(&self, key: &str) -> Duration {
        let loaded = self.state.initialized();
        let state = self.state().await;
        if loaded {
            self.refresh(state).await;
        }
        let now = Instant::now();
        state
            .lock()
            .get(key)
            .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(now))
    }

    /// Wait until `key` is allowed, or the token fires.
    pub async fn wait_turn(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ThrottleCancelled> {
        loop {
            let remaining = self.remaining(key).await;
            if remaining.is_zero() {
                return Ok(());
            }
            debug!(key, wait_ms = remaining.as_millis(), "Waiting for throttle window");
            tokio::select! {
                () = tokio::time::sleep(remaining) => {}
                () = cancel.cancelled() => return Err(ThrottleCancelled),
            }
        }
    }

    /// Push the not-before deadline of `key` to at least `now + delay`.
    pub async fn defer(&self, key: &str, delay: Duration) {
        let deadline = Instant::now() + delay;
        let snapshot = {
            let mut state = self.state().await.lock();
            let entry = state.entry(key.to_string()).or_insert(deadline);
            if *entry < deadline {
                *entry = deadline;
            }
            state.clone()
        };
        if let Some(path) = &self.path
            && let Err(e) = persist_deadlines(path, &snapshot).await
        {
            warn!(path = %path.display(), error = %e, "Failed to persist throttle state");
        }
    }
}

async fn load_deadlines(path: &Path) -> HashMap<String, Instant> {
    let raw: HashMap<String, u64> = match tokio::fs::read_to_string(path).await {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unparsable throttle state");
                return HashMap::new();
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read throttle state");
            return HashMap::new();
        }
    };

    let now_ms = epoch_ms_now();
    let now = Instant::now();
    raw.into_iter()
        .filter(|(_, at_ms)| *at_ms > now_ms)
        .map(|(key, at_ms)| (key, now + Duration::from_millis(at_ms - now_ms)))
        .collect()
}

/// Merge our deadlines with whatever another process wrote and replace the
/// file atomically.
async fn persist_deadlines(path: &Path, deadlines: &HashMap<String, Instant>) -> std::io::Result<()> {
    let now_ms = epoch_ms_now();
    let now = Instant::now();

    let mut merged: HashMap<String, u64> = match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => HashMap::new(),
    };
    merged.retain(|_, at_ms| *at_ms > now_ms);
    for (key, deadline) in deadlines {
        let remaining = duration_ms(deadline.saturating_duration_since(now));
        if remaining == 0 {
            continue;
        }
        let at_ms = now_ms.saturating_add(remaining);
        let slot = merged.entry(key.clone()).or_insert(at_ms);
        *slot = (*slot).max(at_ms);
    }

    write_json_atomic(path, &merged).await
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn defer_sets_and_extends_deadline() {
        let gate = ThrottleGate::in_memory();
        assert_eq!(gate.remaining("llm").await, Duration::ZERO);

        gate.defer("llm", Duration::from_secs(5)).await;
        assert_eq!(gate.remaining("llm").await, Duration::from_secs(5));

        // A shorter deferral never pulls the deadline in.
        gate.defer("llm", Duration::from_secs(1)).await;
        assert_eq!(gate.remaining("llm").await, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(gate.remaining("llm").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_turn_blocks_until_deadline() {
        let gate = ThrottleGate::in_memory();
        gate.defer("llm", Duration::from_secs(2)).await;

        let start = Instant::now();
        gate.wait_turn("llm", &CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        // Other keys are unaffected.
        assert_eq!(gate.remaining("search").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_turn_observes_cancellation() {
        let gate = ThrottleGate::in_memory();
        gate.defer("llm", Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(gate.wait_turn("llm", &cancel).await, Err(ThrottleCancelled));
    }

    #[tokio::test]
    async fn concurrent_first_use_loads_once() {
        let gate = Arc::new(ThrottleGate::in_memory());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.remaining("llm").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Duration::ZERO);
        }
        assert_eq!(gate.load_count(), 1);
    }

    #[tokio::test]
    async fn persisted_deadline_is_seen_by_another_gate() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("throttle.json");

        let first = ThrottleGate::persistent(&path);
        first.defer("anthropic", Duration::from_secs(30)).await;

        let second = ThrottleGate::persistent(&path);
        let remaining = second.remaining("anthropic").await;
        assert!(remaining > Duration::from_secs(25), "{remaining:?}");
        assert!(remaining <= Duration::from_secs(30), "{remaining:?}");
    }

    #[tokio::test]
    async fn deadline_written_after_first_load_is_picked_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("throttle.json");

        let first = ThrottleGate::persistent(&path);
        assert_eq!(first.remaining("anthropic").await, Duration::ZERO);

        let second = ThrottleGate::persistent(&path);
        second.defer("anthropic", Duration::from_secs(30)).await;

        let remaining = first.remaining("anthropic").await;
        assert!(remaining > Duration::from_secs(25), "{remaining:?}");
        assert_eq!(first.load_count(), 1);
        // Keys nobody deferred stay open.
        assert_eq!(first.remaining("search").await, Duration::ZERO);
    }

    #[tokio::test]
    async fn corrupt_state_file_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("throttle.json");
        std::fs::write(&path, "{not json").unwrap();

        let gate = ThrottleGate::persistent(&path);
        assert_eq!(gate.remaining("anthropic").await, Duration::ZERO);
    }
}
