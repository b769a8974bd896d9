//! Shared sink metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all sink types.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    /// Total rows appended.
    pub rows_emitted: AtomicU64,

    /// Total emit_rows calls.
    pub emit_calls: AtomicU64,

    /// Flush operations performed.
    pub flush_count: AtomicU64,

    /// Largest timestamp reported durable.
    pub flushed_ts: AtomicU64,

    /// Emit or flush failures.
    pub errors: AtomicU64,
}

impl SinkMetrics {
    pub const fn new() -> Self {
        Self {
            rows_emitted: AtomicU64::new(0),
            emit_calls: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            flushed_ts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn emit(&self, rows: u64) {
        self.emit_calls.fetch_add(1, Ordering::Relaxed);
        self.rows_emitted.fetch_add(rows, Ordering::Relaxed);
    }

    #[inline]
    pub fn flush(&self, durable_ts: u64) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.flushed_ts.fetch_max(durable_ts, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
            emit_calls: self.emit_calls.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            flushed_ts: self.flushed_ts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of sink metrics.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub rows_emitted: u64,
    pub emit_calls: u64,
    pub flush_count: u64,
    pub flushed_ts: u64,
    pub errors: u64,
}
