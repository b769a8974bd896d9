//! Byte-budget backpressure for puller buffers.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// A blurred memory limiter.
///
/// "Blurred" because enforcement is approximate: an acquire is admitted as
/// long as usage is *below* the budget when it arrives, so the budget can be
/// overshot by up to one entry per concurrent acquirer. That keeps the hot
/// path to a single atomic in the common case while still bounding total
/// puller buffer growth.
///
/// Pullers acquire on ingest; the consumer releases once the entry has been
/// handed to the sorter.
pub struct MemoryLimiter {
    budget: usize,
    used: AtomicUsize,
    freed: Notify,
}

impl MemoryLimiter {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: AtomicUsize::new(0),
            freed: Notify::new(),
        }
    }

    /// Account `bytes`, suspending while the budget is exhausted.
    pub async fn acquire(&self, bytes: usize) {
        loop {
            // Register interest before checking, so a concurrent release
            // cannot slip between the check and the wait.
            let freed = self.freed.notified();
            if self.used.load(Ordering::Acquire) < self.budget {
                self.used.fetch_add(bytes, Ordering::AcqRel);
                return;
            }
            freed.await;
        }
    }

    /// Return `bytes` to the budget and wake waiters.
    pub fn release(&self, bytes: usize) {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            })
            .ok();
        self.freed.notify_waiters();
    }

    /// Current accounted usage.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}
