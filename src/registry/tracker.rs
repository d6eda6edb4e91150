//! Registration recency order used for stale pruning.

use std::collections::{BTreeMap, HashMap};

use crate::registry::backend::BackendId;

/// Backends ordered by when they were last registered, oldest first.
///
/// Touching a backend moves it to the back, so each backend appears exactly
/// once no matter how often it re-registers.
#[derive(Debug, Default)]
pub struct StaleTracker {
    order: BTreeMap<u64, BackendId>,
    seq_of: HashMap<BackendId, u64>,
    next_seq: u64,
}

impl StaleTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` at the back, or move it there if already tracked.
    pub fn touch(&mut self, id: &BackendId) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(old) = self.seq_of.insert(id.clone(), seq) {
            self.order.remove(&old);
        }
        self.order.insert(seq, id.clone());
    }

    /// Stop tracking `id`. Returns false when it was not tracked.
    pub fn remove(&mut self, id: &BackendId) -> bool {
        match self.seq_of.remove(id) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Least recently touched backend.
    pub fn front(&self) -> Option<&BackendId> {
        self.order.values().next()
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: &BackendId) -> bool {
        self.seq_of.contains_key(id)
    }

    /// Forget every backend. Used while the bus is unreachable.
    pub fn clear(&mut self) {
        self.order.clear();
        self.seq_of.clear();
    }

    /// Number of tracked backends.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
