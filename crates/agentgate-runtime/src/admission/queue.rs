//! Bounded queue of admissions waiting for capacity.
//!
//! Ordering is by priority (higher first), then arrival. When the queue is
//! full the lowest-priority, oldest entry is evicted to make room, unless the
//! newcomer ranks below it, in which case the newcomer is refused.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One waiting admission.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: Uuid,
    pub priority: i32,
    seq: u64,
    /// Fired when the entry is evicted to make room for another.
    pub evicted: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("pending queue is full ({max} waiting)")]
    Full { max: usize },

    #[error("eviction index {index} out of range for queue of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Debug)]
pub struct PendingQueue {
    entries: Vec<PendingEntry>,
    max_size: usize,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size: max_size.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Add a waiter. Returns the new entry and, if the queue was full, the
    /// entry evicted to make room (its `evicted` token already fired).
    pub fn enqueue(&mut self, priority: i32) -> Result<(PendingEntry, Option<PendingEntry>), QueueError> {
        let mut evicted = None;
        if self.entries.len() >= self.max_size {
            let victim = self
                .victim_index()
                .ok_or(QueueError::Full { max: self.max_size })?;
            if self.entries[victim].priority > priority {
                return Err(QueueError::Full { max: self.max_size });
            }
            let entry = self.evict_at(victim)?;
            entry.evicted.cancel();
            evicted = Some(entry);
        }

        let entry = PendingEntry {
            id: Uuid::new_v4(),
            priority,
            seq: self.next_seq,
            evicted: CancellationToken::new(),
        };
        self.next_seq += 1;
        self.entries.push(entry.clone());
        Ok((entry, evicted))
    }

    /// The waiter allowed to claim capacity next.
    pub fn head(&self) -> Option<Uuid> {
        self.entries
            .iter()
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|e| e.id)
    }

    /// Index of the entry to evict when full: lowest priority, oldest first.
    pub fn victim_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq)))
            .map(|(i, _)| i)
    }

    /// Remove the entry at `index`, rejecting indices past the end.
    pub fn evict_at(&mut self, index: usize) -> Result<PendingEntry, QueueError> {
        if index >= self.entries.len() {
            return Err(QueueError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        Ok(self.entries.remove(index))
    }

    /// Remove the entry with `id`. Returns whether it was present.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }
}
