//! Admission control: the global reservation system bounding how much agent
//! work runs at once.
//!
//! Two ceilings are enforced, each over "in use + reserved":
//!
//! - requests: `active_requests + reserved_slots <= max_total_active_requests`
//!   (lowered by cross-process fair share, see
//!   [`AdmissionController::set_instance_count`])
//! - LLM calls: `active_llm + reserved_llm <= max_total_active_llm`
//!
//! The check and the reservation it grants happen inside one
//! `parking_lot` critical section, so the invariants hold on a
//! multi-threaded runtime. Reservations expire unless heartbeated; a lazily
//! started sweeper reclaims them.

mod lease;
mod queue;
mod state;
mod sweeper;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agentgate_core::config::{AdmissionConfig, Config, ParallelismScope, RuntimeLimits};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use lease::{ActiveLease, Reservation};
pub use queue::{PendingEntry, PendingQueue, QueueError};

use state::{RuntimeState, Shared};

/// What an admission asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Counts against `max_total_active_requests`.
    pub needs_slot: bool,
    /// Counts against `max_total_active_llm`.
    pub llm_slots: u32,
    /// Higher is served first while waiting.
    pub priority: i32,
}

impl Default for AdmissionRequest {
    fn default() -> Self {
        Self {
            needs_slot: true,
            llm_slots: 0,
            priority: 0,
        }
    }
}

impl AdmissionRequest {
    /// One request slot and one LLM slot: a typical agent run.
    pub const fn agent_run() -> Self {
        Self {
            needs_slot: true,
            llm_slots: 1,
            priority: 0,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub const fn slots(&self) -> u32 {
        if self.needs_slot { 1 } else { 0 }
    }
}

/// Which ceiling rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    Requests,
    Llm,
}

impl std::fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requests => f.write_str("requests"),
            Self::Llm => f.write_str("llm"),
        }
    }
}

/// Diagnostic view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub active_requests: u32,
    pub active_llm: u32,
    pub live_reservations: usize,
    pub reserved_slots: u32,
    pub reserved_llm: u32,
    pub request_limit: u32,
    pub llm_limit: u32,
    pub queued: usize,
}

impl CapacitySnapshot {
    /// Requests in use plus slot-holding reservations.
    pub const fn committed_requests(&self) -> u32 {
        self.active_requests.saturating_add(self.reserved_slots)
    }

    pub const fn committed_llm(&self) -> u32 {
        self.active_llm.saturating_add(self.reserved_llm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("capacity exceeded for {resource}: {projected} > {limit}")]
    CapacityExceeded {
        resource: CapacityKind,
        projected: u32,
        limit: u32,
    },

    #[error("system busy: no capacity after waiting {waited:?}")]
    Busy { waited: Duration },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("admission evicted from the pending queue")]
    Evicted,

    #[error("admission cancelled")]
    Cancelled,

    #[error("reservation {id} expired")]
    ReservationExpired { id: Uuid },
}

impl AdmissionError {
    /// Whether waiting and trying again may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::Busy { .. })
    }
}

/// Process-wide admission controller. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

/// Removes a waiter from the queue when `reserve_with_wait` returns or is
/// dropped, and lets the next head try.
struct QueueTicket<'a> {
    shared: &'a Shared,
    id: Uuid,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        let removed = self.shared.state.lock().queue.remove(self.id);
        if removed {
            self.shared.released.notify_waiters();
        }
    }
}

impl AdmissionController {
    pub fn new(limits: RuntimeLimits, admission: &AdmissionConfig) -> Self {
        let state = RuntimeState::new(&limits, admission.max_queue_size);
        info!(
            max_total_active_requests = limits.max_total_active_requests,
            max_total_active_llm = limits.max_total_active_llm,
            "Admission controller created"
        );
        Self {
            shared: Arc::new(Shared {
                limits,
                reservation_ttl: admission.reservation_ttl(),
                sweep_interval: admission.sweep_interval(),
                state: Mutex::new(state),
                released: Notify::new(),
                sweeper_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.limits.clone(), &config.admission)
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.shared.limits
    }

    /// Per-run fan-out ceiling for `scope`, clamped to at least 1.
    pub fn clamp_parallelism(&self, scope: ParallelismScope, requested: i64) -> usize {
        self.shared.limits.clamp_parallelism(scope, requested)
    }

    /// Whether the sweeper has been started.
    pub fn sweeper_running(&self) -> bool {
        self.shared.sweeper_started.load(Ordering::Acquire)
    }

    fn ensure_sweeper(&self) {
        if !self.shared.sweeper_started.load(Ordering::Acquire) && !self.shared.shutdown.is_cancelled() {
            sweeper::ensure_started(&self.shared);
        }
    }

    fn reservation(&self, state: &mut RuntimeState, request: &AdmissionRequest) -> Result<Reservation, AdmissionError> {
        let (id, entry) = self.shared.reserve_locked(state, request)?;
        Ok(Reservation::new(
            id,
            Arc::clone(&self.shared),
            entry.slots,
            entry.llm_slots,
            entry.expires_at,
        ))
    }

    /// Check capacity and reserve it if available.
    ///
    /// Fails with [`AdmissionError::CapacityExceeded`] without waiting.
    pub fn try_reserve(&self, request: &AdmissionRequest) -> Result<Reservation, AdmissionError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(AdmissionError::Cancelled);
        }
        self.ensure_sweeper();
        let mut state = self.shared.state.lock();
        let reservation = self.reservation(&mut state, request);
        drop(state);
        match &reservation {
            Ok(r) => debug!(reservation_id = %r.id(), "Capacity reserved"),
            Err(AdmissionError::CapacityExceeded {
                resource,
                projected,
                limit,
            }) => debug!(%resource, projected, limit, "Capacity exceeded"),
            Err(_) => {}
        }
        reservation
    }

    /// Reserve capacity, waiting up to `capacity_wait` for it to free up.
    ///
    /// Rejected callers join the pending queue and re-check every
    /// `capacity_poll`, or earlier when capacity is returned. Only the queue
    /// head may claim capacity, so a stream of newcomers cannot starve an
    /// older or more important waiter.
    pub async fn reserve_with_wait(
        &self,
        request: &AdmissionRequest,
        cancel: &CancellationToken,
    ) -> Result<Reservation, AdmissionError> {
        if self.shared.shutdown.is_cancelled() || cancel.is_cancelled() {
            return Err(AdmissionError::Cancelled);
        }
        self.ensure_sweeper();

        let started = Instant::now();
        let deadline = started + self.shared.limits.capacity_wait();
        let poll = self.shared.limits.capacity_poll().max(Duration::from_millis(1));

        let entry = {
            let mut state = self.shared.state.lock();
            if state.queue.is_empty() {
                match self.reservation(&mut state, request) {
                    Ok(reservation) => return Ok(reservation),
                    Err(AdmissionError::CapacityExceeded { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            let (entry, evicted) = state.queue.enqueue(request.priority)?;
            if let Some(evicted) = evicted {
                warn!(evicted = %evicted.id, priority = evicted.priority, "Pending queue full, evicted waiter");
            }
            entry
        };
        let _ticket = QueueTicket {
            shared: &self.shared,
            id: entry.id,
        };
        debug!(waiter = %entry.id, priority = request.priority, "Waiting for capacity");

        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.queue.head() == Some(entry.id) {
                    match self.reservation(&mut state, request) {
                        Ok(reservation) => {
                            state.queue.remove(entry.id);
                            drop(state);
                            self.shared.released.notify_waiters();
                            debug!(
                                reservation_id = %reservation.id(),
                                waited_ms = started.elapsed().as_millis(),
                                "Capacity reserved after waiting"
                            );
                            return Ok(reservation);
                        }
                        Err(AdmissionError::CapacityExceeded { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!(waited_ms = waited.as_millis(), "No capacity within wait budget");
                return Err(AdmissionError::Busy { waited });
            }
            let tick = (deadline - now).min(poll);

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(tick) => {}
                () = entry.evicted.cancelled() => return Err(AdmissionError::Evicted),
                () = cancel.cancelled() => return Err(AdmissionError::Cancelled),
                () = self.shared.shutdown.cancelled() => return Err(AdmissionError::Cancelled),
            }
        }
    }

    /// Wait for capacity and start using it straight away.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        cancel: &CancellationToken,
    ) -> Result<ActiveLease, AdmissionError> {
        self.reserve_with_wait(request, cancel).await?.consume()
    }

    /// Lower the request ceiling to this process's fair share when `count`
    /// instances share the machine. Never exceeds the configured ceiling.
    pub fn set_instance_count(&self, count: usize) {
        let total = self.shared.limits.max_total_active_requests;
        let divisor = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
        let share = (total / divisor).max(1);
        let raised = {
            let mut state = self.shared.state.lock();
            let previous = state.request_limit;
            state.request_limit = share;
            share > previous
        };
        debug!(instances = count, request_limit = share, "Fair share updated");
        if raised {
            self.shared.released.notify_waiters();
        }
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        let mut state = self.shared.state.lock();
        state.prune_expired(Instant::now());
        state.snapshot(self.shared.limits.max_total_active_llm)
    }

    /// Run one sweeper pass now. Returns the number of reservations removed.
    pub fn sweep_now(&self) -> usize {
        self.shared.sweep()
    }

    /// Stop the sweeper and fail all current and future waiters.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("Admission controller shutting down");
            self.shared.shutdown.cancel();
        }
    }
}
