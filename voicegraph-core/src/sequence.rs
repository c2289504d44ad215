//! Sequence guard — the staleness primitive shared by both subsystems.
//!
//! A monotonically increasing counter identifies attempt order. An async
//! result is stale when a strictly newer attempt has superseded it; stale
//! results must be checked-and-discarded at every resumption point because
//! cancellation here is cooperative, not preemptive.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counter with staleness comparison.
///
/// Used by the resource manager both as the generation sequence (invalidates
/// stale streaming callbacks and results) and as the resource epoch
/// (invalidates an entire in-flight initialization after a teardown).
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Advance to the next value and return it.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued value.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether `seq` is still the newest issued value.
    pub fn is_current(&self, seq: u64) -> bool {
        self.current() == seq
    }
}

/// Whether an attempt with sequence `seq` has been superseded by an already
/// accepted, strictly newer attempt.
pub fn superseded(seq: u64, last_accepted: Option<u64>) -> bool {
    last_accepted.map_or(false, |accepted| seq < accepted)
}
