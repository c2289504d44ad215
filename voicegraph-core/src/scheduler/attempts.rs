//! Bounded bookkeeping of attempts currently awaiting a result.
//!
//! This is not an ownership structure for cancellation: evicting an entry
//! only stops it from counting as active — the underlying call keeps running
//! and its eventual result still goes through the normal staleness check.

use std::collections::HashMap;
use std::time::Instant;

/// Active-attempt set, bounded by `max_concurrent_attempts`.
#[derive(Debug)]
pub struct AttemptSet {
    started: HashMap<u64, Instant>,
    /// Id of the earliest-started tracked attempt.
    oldest: Option<u64>,
    capacity: usize,
}

impl AttemptSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            started: HashMap::new(),
            oldest: None,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.started.len()
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.started.contains_key(&id)
    }

    /// Track a newly started attempt, evicting the tracked-oldest entry
    /// first when at capacity.
    pub fn insert(&mut self, id: u64, started_at: Instant) {
        if self.capacity == 0 {
            return;
        }
        if self.started.len() >= self.capacity {
            if let Some(oldest) = self.oldest.take() {
                self.started.remove(&oldest);
            }
            self.recompute_oldest();
        }
        self.started.insert(id, started_at);
        let is_new_oldest = match self.oldest {
            None => true,
            Some(oldest) => self
                .started
                .get(&oldest)
                .map_or(true, |at| started_at < *at),
        };
        if is_new_oldest {
            self.oldest = Some(id);
        }
    }

    /// Stop tracking a settled attempt. Returns whether it was tracked.
    pub fn remove(&mut self, id: u64) -> bool {
        let was_tracked = self.started.remove(&id).is_some();
        if self.oldest == Some(id) {
            self.recompute_oldest();
        }
        was_tracked
    }

    pub fn clear(&mut self) {
        self.started.clear();
        self.oldest = None;
    }

    fn recompute_oldest(&mut self) {
        // Earliest start instant wins; ties break on the smaller id.
        self.oldest = self
            .started
            .iter()
            .min_by_key(|(id, at)| (**at, **id))
            .map(|(id, _)| *id);
    }
}
