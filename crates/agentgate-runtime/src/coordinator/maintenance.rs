//! The coordinator's background loop: heartbeat, dead-instance purge and
//! expired-lock cleanup. At most one runs per coordinator.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::admission::AdmissionController;

impl Coordinator {
    /// Spawn the maintenance loop unless it is already running.
    ///
    /// With `admission`, every heartbeat also refreshes the controller's
    /// fair share from the number of live instances.
    pub fn start_maintenance(
        self: &Arc<Self>,
        cancel: CancellationToken,
        admission: Option<AdmissionController>,
    ) -> Option<JoinHandle<()>> {
        if self
            .maintenance_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Coordinator maintenance already running");
            return None;
        }
        Some(tokio::spawn(run(Arc::clone(self), cancel, admission)))
    }

    pub fn maintenance_running(&self) -> bool {
        self.maintenance_started.load(Ordering::Acquire)
    }

    /// Heartbeat and refresh the fair share.
    pub async fn heartbeat_pass(&self, admission: Option<&AdmissionController>) {
        if let Err(e) = self.heartbeat().await {
            warn!(error = %e, "Instance heartbeat failed");
        }
        if let Some(admission) = admission {
            match self.live_instance_count().await {
                Ok(live) => admission.set_instance_count(live),
                Err(e) => warn!(error = %e, "Failed to count live instances"),
            }
        }
    }

    /// Purge dead instances and expired locks.
    pub async fn cleanup_pass(&self) {
        match self.purge_dead_instances().await {
            Ok(purged) if !purged.is_empty() => info!(count = purged.len(), "Dead instances purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dead instance purge failed"),
        }
        if let Err(e) = self.cleanup_expired_locks().await {
            warn!(error = %e, "Lock cleanup failed");
        }
    }
}

async fn run(coordinator: Arc<Coordinator>, cancel: CancellationToken, admission: Option<AdmissionController>) {
    let config = coordinator.config();
    let period = |ms: u64| Duration::from_millis(ms.max(1));
    let mut heartbeat = tokio::time::interval(period(config.heartbeat_interval_ms));
    let mut cleanup = tokio::time::interval(period(config.cleanup_interval_ms));
    heartbeat.tick().await; // Skip first immediate tick
    cleanup.tick().await;
    info!(instance_id = coordinator.instance_id(), "Coordinator maintenance started");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => coordinator.heartbeat_pass(admission.as_ref()).await,
            _ = cleanup.tick() => coordinator.cleanup_pass().await,
            () = cancel.cancelled() => {
                info!("Coordinator maintenance shutting down");
                break;
            }
        }
    }
    coordinator.maintenance_started.store(false, Ordering::Release);
}
