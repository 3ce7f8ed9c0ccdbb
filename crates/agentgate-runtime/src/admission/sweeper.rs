//! Background loop reclaiming expired reservations.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::Shared;

/// `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Start the sweeper for `shared` unless one is already running.
///
/// Returns `None` when another caller won the start race or there is no
/// Tokio runtime to spawn on (the flag is cleared again so a later call
/// can retry).
pub(super) fn ensure_started(shared: &Arc<Shared>) -> Option<JoinHandle<()>> {
    if shared
        .sweeper_started
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return None;
    }
    let Ok(handle) = Handle::try_current() else {
        shared.sweeper_started.store(false, Ordering::Release);
        debug!("No runtime available, reservation sweeper not started");
        return None;
    };
    Some(handle.spawn(run(
        Arc::downgrade(shared),
        shared.sweep_interval,
        shared.shutdown.clone(),
    )))
}

async fn run(
    shared: Weak<Shared>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let interval = interval.max(MIN_INTERVAL);
    let mut timer = tokio::time::interval(interval);
    timer.tick().await; // Skip first immediate tick
    info!(interval_ms = interval.as_millis(), "Reservation sweeper started");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let Some(shared) = shared.upgrade() else {
                    debug!("Admission controller dropped, sweeper exiting");
                    return;
                };
                let removed = shared.sweep();
                if removed > 0 {
                    info!(removed, "Swept expired reservations");
                }
            }
            () = shutdown.cancelled() => {
                info!("Reservation sweeper shutting down");
                return;
            }
        }
    }
}
