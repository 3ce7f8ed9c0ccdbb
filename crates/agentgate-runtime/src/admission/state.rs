//! Admission bookkeeping shared by the controller, its leases and the sweeper.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use agentgate_core::RuntimeLimits;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::queue::PendingQueue;
use super::{AdmissionError, AdmissionRequest, CapacityKind, CapacitySnapshot};

#[derive(Debug, Clone, Copy)]
pub(super) struct ReservationEntry {
    pub slots: u32,
    pub llm_slots: u32,
    pub expires_at: Instant,
}

/// Mutable admission state. Only ever touched under [`Shared::state`].
#[derive(Debug)]
pub(super) struct RuntimeState {
    pub active_requests: u32,
    pub active_llm: u32,
    pub reservations: HashMap<Uuid, ReservationEntry>,
    /// Effective request ceiling after cross-process fair share.
    pub request_limit: u32,
    pub queue: PendingQueue,
}

impl RuntimeState {
    pub fn new(limits: &RuntimeLimits, max_queue_size: usize) -> Self {
        Self {
            active_requests: 0,
            active_llm: 0,
            reservations: HashMap::new(),
            request_limit: limits.max_total_active_requests,
            queue: PendingQueue::new(max_queue_size),
        }
    }

    fn reserved(&self) -> (u32, u32) {
        self.reservations
            .values()
            .fold((0u32, 0u32), |(slots, llm), entry| {
                (slots.saturating_add(entry.slots), llm.saturating_add(entry.llm_slots))
            })
    }

    /// Drop reservations whose TTL has passed. Returns how many were removed.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|_, entry| entry.expires_at > now);
        before - self.reservations.len()
    }

    /// Check `request` against both ceilings without mutating anything.
    pub fn check(&self, request: &AdmissionRequest, llm_limit: u32) -> Result<(), AdmissionError> {
        let (reserved_slots, reserved_llm) = self.reserved();

        let projected = self
            .active_requests
            .saturating_add(reserved_slots)
            .saturating_add(request.slots());
        if projected > self.request_limit {
            return Err(AdmissionError::CapacityExceeded {
                resource: CapacityKind::Requests,
                projected,
                limit: self.request_limit,
            });
        }

        let projected_llm = self
            .active_llm
            .saturating_add(reserved_llm)
            .saturating_add(request.llm_slots);
        if projected_llm > llm_limit {
            return Err(AdmissionError::CapacityExceeded {
                resource: CapacityKind::Llm,
                projected: projected_llm,
                limit: llm_limit,
            });
        }
        Ok(())
    }

    pub fn snapshot(&self, llm_limit: u32) -> CapacitySnapshot {
        let (reserved_slots, reserved_llm) = self.reserved();
        CapacitySnapshot {
            active_requests: self.active_requests,
            active_llm: self.active_llm,
            live_reservations: self.reservations.len(),
            reserved_slots,
            reserved_llm,
            request_limit: self.request_limit,
            llm_limit,
            queued: self.queue.len(),
        }
    }
}

/// State plus the signals around it, owned jointly by the controller and
/// every outstanding reservation or lease.
#[derive(Debug)]
pub(super) struct Shared {
    pub limits: RuntimeLimits,
    pub reservation_ttl: Duration,
    pub sweep_interval: Duration,
    pub state: Mutex<RuntimeState>,
    /// Woken whenever capacity is returned or the queue head changes.
    pub released: Notify,
    pub sweeper_started: AtomicBool,
    pub shutdown: CancellationToken,
}

impl Shared {
    /// Check and register a reservation in one critical section.
    pub fn reserve_locked(
        &self,
        state: &mut RuntimeState,
        request: &AdmissionRequest,
    ) -> Result<(Uuid, ReservationEntry), AdmissionError> {
        let now = Instant::now();
        state.prune_expired(now);
        state.check(request, self.limits.max_total_active_llm)?;

        let id = Uuid::new_v4();
        let entry = ReservationEntry {
            slots: request.slots(),
            llm_slots: request.llm_slots,
            expires_at: now + self.reservation_ttl,
        };
        state.reservations.insert(id, entry);
        Ok((id, entry))
    }

    /// Forget a reservation (explicit release, drop, or consume failure).
    pub fn drop_reservation(&self, id: Uuid) -> bool {
        let removed = self.state.lock().reservations.remove(&id).is_some();
        if removed {
            self.released.notify_waiters();
        }
        removed
    }

    /// Return the capacity held by a finished lease.
    pub fn finish_active(&self, slots: u32, llm_slots: u32) {
        {
            let mut state = self.state.lock();
            state.active_requests = state.active_requests.saturating_sub(slots);
            state.active_llm = state.active_llm.saturating_sub(llm_slots);
        }
        self.released.notify_waiters();
    }

    /// One sweeper pass. Returns the number of expired reservations removed.
    pub fn sweep(&self) -> usize {
        let removed = self.state.lock().prune_expired(Instant::now());
        if removed > 0 {
            self.released.notify_waiters();
        }
        removed
    }
}
