//! Processor metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges for one processor, refreshed by the metrics task and
/// on the hot paths that own each value.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    /// Tables currently installed (mark tables excluded).
    pub table_count: AtomicU64,

    /// Local resolved watermark.
    pub resolved_ts: AtomicU64,

    /// Durable checkpoint.
    pub checkpoint_ts: AtomicU64,

    /// Watermark last published to the sink.
    pub sink_emitted_resolved_ts: AtomicU64,

    /// Successful task-status flush passes.
    pub status_flushes: AtomicU64,

    /// Sink flush calls and their cumulative duration.
    pub flush_count: AtomicU64,
    pub flush_micros_total: AtomicU64,

    /// Flushes that exceeded the slow threshold (3 s).
    pub slow_flushes: AtomicU64,

    /// Times the merger clamped its watermark down to the local resolved
    /// (table-add fallback).
    pub resolved_fallbacks: AtomicU64,
}

impl ProcessorMetrics {
    pub fn record_flush(&self, micros: u64, slow: bool) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.flush_micros_total.fetch_add(micros, Ordering::Relaxed);
        if slow {
            self.slow_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            table_count: self.table_count.load(Ordering::Relaxed),
            resolved_ts: self.resolved_ts.load(Ordering::Relaxed),
            checkpoint_ts: self.checkpoint_ts.load(Ordering::Relaxed),
            sink_emitted_resolved_ts: self.sink_emitted_resolved_ts.load(Ordering::Relaxed),
            status_flushes: self.status_flushes.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            flush_micros_total: self.flush_micros_total.load(Ordering::Relaxed),
            slow_flushes: self.slow_flushes.load(Ordering::Relaxed),
            resolved_fallbacks: self.resolved_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of processor metrics.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub table_count: u64,
    pub resolved_ts: u64,
    pub checkpoint_ts: u64,
    pub sink_emitted_resolved_ts: u64,
    pub status_flushes: u64,
    pub flush_count: u64,
    pub flush_micros_total: u64,
    pub slow_flushes: u64,
    pub resolved_fallbacks: u64,
}
