//! Capacity claims handed out by the controller.
//!
//! A [`Reservation`] is a time-bounded claim that the sweeper reclaims once
//! its TTL passes without a heartbeat. [`Reservation::consume`] turns it into
//! an [`ActiveLease`] for the duration of the actual work. Dropping either
//! one returns its capacity, so work that is cancelled mid-flight cannot leak
//! slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::AdmissionError;
use super::state::Shared;

/// Time-bounded claim on capacity.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    id: Uuid,
    shared: Arc<Shared>,
    slots: u32,
    llm_slots: u32,
    expires_at: Instant,
    settled: bool,
}

impl Reservation {
    pub(super) const fn new(
        id: Uuid,
        shared: Arc<Shared>,
        slots: u32,
        llm_slots: u32,
        expires_at: Instant,
    ) -> Self {
        Self {
            id,
            shared,
            slots,
            llm_slots,
            expires_at,
            settled: false,
        }
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub const fn slots(&self) -> u32 {
        self.slots
    }

    pub const fn llm_slots(&self) -> u32 {
        self.llm_slots
    }

    /// Push the expiry to at least `now + extend`.
    ///
    /// Fails if the sweeper already reclaimed the reservation; the capacity
    /// may have been granted to someone else by then.
    pub fn heartbeat(&mut self, extend: Duration) -> Result<Instant, AdmissionError> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.prune_expired(now);
        let Some(entry) = state.reservations.get_mut(&self.id) else {
            return Err(AdmissionError::ReservationExpired { id: self.id });
        };
        entry.expires_at = entry.expires_at.max(now + extend);
        self.expires_at = entry.expires_at;
        Ok(self.expires_at)
    }

    /// Give the capacity back without using it.
    pub fn release(mut self) {
        self.settled = true;
        if self.shared.drop_reservation(self.id) {
            debug!(reservation_id = %self.id, "Reservation released");
        }
    }

    /// Start the work: move the reserved slots into the active counters.
    pub fn consume(mut self) -> Result<ActiveLease, AdmissionError> {
        self.settled = true;
        let now = Instant::now();
        {
            let mut state = self.shared.state.lock();
            state.prune_expired(now);
            let Some(entry) = state.reservations.remove(&self.id) else {
                return Err(AdmissionError::ReservationExpired { id: self.id });
            };
            state.active_requests = state.active_requests.saturating_add(entry.slots);
            state.active_llm = state.active_llm.saturating_add(entry.llm_slots);
        }
        debug!(reservation_id = %self.id, "Reservation consumed");
        Ok(ActiveLease {
            id: self.id,
            shared: Arc::clone(&self.shared),
            slots: self.slots,
            llm_slots: self.llm_slots,
            started_at: now,
            finished: false,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled && self.shared.drop_reservation(self.id) {
            debug!(reservation_id = %self.id, "Reservation dropped");
        }
    }
}

/// Capacity in active use. Returned when finished or dropped.
#[derive(Debug)]
#[must_use = "dropping a lease ends it immediately"]
pub struct ActiveLease {
    id: Uuid,
    shared: Arc<Shared>,
    slots: u32,
    llm_slots: u32,
    started_at: Instant,
    finished: bool,
}

impl ActiveLease {
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn finish(mut self) {
        self.finish_inner();
    }

    fn finish_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.finish_active(self.slots, self.llm_slots);
        debug!(
            lease_id = %self.id,
            elapsed_ms = self.started_at.elapsed().as_millis(),
            "Lease finished"
        );
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.finish_inner();
    }
}
