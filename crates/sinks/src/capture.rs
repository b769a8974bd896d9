//! Call-sequence-recording sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use drift_model::{RowChange, Ts};

use crate::sink::{Sink, SinkError};

/// One observed sink call.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    EmitRows(Vec<RowChange>),
    Flush(Ts),
    Close,
}

/// Records the exact order of `emit_rows` / `flush` / `close` calls so tests
/// can assert the commit-flush protocol. Flush reports the full target as
/// durable unless a cap is installed with [`CaptureSink::set_flush_cap`].
#[derive(Debug, Default)]
pub struct CaptureSink {
    calls: Mutex<Vec<SinkCall>>,
    /// Upper bound on the durable timestamp a flush may report; `0` = none.
    flush_cap: AtomicU64,
    closed: AtomicBool,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the durable timestamp reported by subsequent flushes, modelling a
    /// sink that lags behind the requested target.
    pub fn set_flush_cap(&self, cap: Ts) {
        self.flush_cap.store(cap, Ordering::Release);
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    /// All rows emitted so far, flattened in emission order.
    pub fn emitted_rows(&self) -> Vec<RowChange> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SinkCall::EmitRows(rows) => Some(rows.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Durable timestamps reported by flushes, in order.
    pub fn flushed_ts(&self) -> Vec<Ts> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Flush(ts) => Some(*ts),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Sink for CaptureSink {
    async fn emit_rows(&self, rows: &[RowChange]) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        // Empty batches are legal but uninteresting to assert on.
        if !rows.is_empty() {
            self.calls
                .lock()
                .unwrap()
                .push(SinkCall::EmitRows(rows.to_vec()));
        }
        Ok(())
    }

    async fn flush(&self, target_ts: Ts) -> Result<Ts, SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let cap = self.flush_cap.load(Ordering::Acquire);
        let durable = if cap == 0 { target_ts } else { target_ts.min(cap) };
        self.calls.lock().unwrap().push(SinkCall::Flush(durable));
        Ok(durable)
    }

    async fn close(&self) -> Result<(), SinkError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.calls.lock().unwrap().push(SinkCall::Close);
        }
        Ok(())
    }
}
