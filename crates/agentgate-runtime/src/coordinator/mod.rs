//! Cross-process coordination over a shared state directory.
//!
//! Independent processes that share nothing but a directory use it to
//! exclude each other from named resources and to notice each other's
//! existence:
//!
//! ```text
//! <state_dir>/
//!   locks/<resource>.lock        one JSON LockRecord per held resource
//!   instances/<instance_id>.json one JSON InstanceRecord per live process
//! ```
//!
//! Mutual exclusion relies on exclusive-create (`O_CREAT | O_EXCL`) being
//! atomic on the shared filesystem. Crashed holders are never notified; their
//! locks simply expire and are reclaimed by the next acquirer or by
//! [`Coordinator::cleanup_expired_locks`].
//!
//! Not handled: network partitions or filesystems without atomic
//! exclusive-create. Two hosts that see diverging views of the directory can
//! both believe they hold a lock.

mod instance;
mod lock;
mod maintenance;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use agentgate_core::config::CoordinatorConfig;
use uuid::Uuid;

use crate::persist::epoch_ms_now;

pub use instance::InstanceRecord;
pub use lock::{CleanupReport, LockHandle, LockRecord, ReleaseOutcome, lock_file_name};

/// Errors from cross-process coordination.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("could not acquire lock on {resource} after {attempts} attempts")]
    LockAcquisitionFailed { resource: String, attempts: u32 },

    #[error("lock on {resource} is no longer held by this owner")]
    LockLost { resource: String },

    #[error("invalid resource name: {0:?}")]
    InvalidResource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One process's view of the shared state directory.
#[derive(Debug)]
pub struct Coordinator {
    state_dir: PathBuf,
    instance_id: String,
    started_at: u64,
    config: CoordinatorConfig,
    maintenance_started: AtomicBool,
}

impl Coordinator {
    /// Coordinator with a fresh instance id.
    pub fn new(state_dir: impl Into<PathBuf>, config: CoordinatorConfig) -> Self {
        Self::with_instance_id(state_dir, Uuid::new_v4().to_string(), config)
    }

    pub fn with_instance_id(
        state_dir: impl Into<PathBuf>,
        instance_id: impl Into<String>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            instance_id: instance_id.into(),
            started_at: epoch_ms_now(),
            config,
            maintenance_started: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.state_dir.join("instances")
    }

    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.config.lock_ttl_ms)
    }

    /// Run `f` while holding `resource`, releasing it afterwards.
    ///
    /// If the future is dropped before completing, the lock is left to
    /// expire after `ttl`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        max_retries: u32,
        f: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.try_acquire_lock(resource, ttl, max_retries).await? else {
            return Err(CoordinatorError::LockAcquisitionFailed {
                resource: resource.to_string(),
                attempts: max_retries.saturating_add(1),
            });
        };
        let value = f().await;
        self.release_lock(handle).await;
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn coordinator(dir: &Path, id: &str) -> Coordinator {
        Coordinator::with_instance_id(dir, id, CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn with_lock_releases_after_closure() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        let b = coordinator(dir.path(), "b");

        let value = a
            .with_lock("deploy", Duration::from_secs(30), 0, || async {
                // Held for the duration of the closure.
                b.try_acquire_lock("deploy", Duration::from_secs(30), 0)
                    .await
                    .unwrap()
                    .is_none()
            })
            .await
            .unwrap();
        assert!(value);
        assert!(a.list_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn with_lock_reports_contention() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = coordinator(dir.path(), "a");
        let b = coordinator(dir.path(), "b");
        let _held = a
            .try_acquire_lock("deploy", Duration::from_secs(30), 0)
            .await
            .unwrap()
            .unwrap();

        let err = b
            .with_lock("deploy", Duration::from_secs(30), 1, || async {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::LockAcquisitionFailed { attempts: 2, .. }
        ));
    }
}
