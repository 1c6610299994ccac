//! Counting semaphore bounding in-flight executions.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Permit counter bounding the number of in-flight executions.
///
/// One permit is held for the entire lifetime of a running execution: from
/// the pick, through the handler and its completion/failure handler, until
/// the post-run database update finishes. Every acquire path must release.
#[derive(Debug)]
pub struct Permits {
    available: AtomicUsize,
    total: usize,
}

impl Permits {
    /// A counter with `total` permits available.
    pub fn new(total: usize) -> Self {
        Self {
            available: AtomicUsize::new(total),
            total,
        }
    }

    /// Take one permit without blocking. Returns `false` when none are free.
    pub fn try_acquire(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Return one permit.
    pub fn release(&self) {
        let prev = self.available.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev < self.total, "permit released more often than acquired");
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Total permits.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.total - self.available()
    }
}
