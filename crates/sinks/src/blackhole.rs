//! Counting discard sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use drift_model::{RowChange, Ts};

use crate::common::{MetricsSnapshot, SinkMetrics};
use crate::sink::{Sink, SinkError};

/// Accepts everything, stores nothing. Flush reports the full target as
/// durable. Useful for throughput testing and as the default sink when no
/// destination is configured.
#[derive(Debug, Default)]
pub struct BlackholeSink {
    metrics: SinkMetrics,
    accumulated_ts: AtomicU64,
    closed: AtomicBool,
}

impl BlackholeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[async_trait]
impl Sink for BlackholeSink {
    async fn emit_rows(&self, rows: &[RowChange]) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        if let Some(last) = rows.last() {
            self.accumulated_ts.fetch_max(last.commit_ts, Ordering::AcqRel);
        }
        self.metrics.emit(rows.len() as u64);
        Ok(())
    }

    async fn flush(&self, target_ts: Ts) -> Result<Ts, SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        self.metrics.flush(target_ts);
        Ok(target_ts)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_and_reports_target() {
        let sink = BlackholeSink::new();
        let rows = vec![RowChange::default(); 3];
        sink.emit_rows(&rows).await.unwrap();
        sink.emit_rows(&[]).await.unwrap();
        assert_eq!(sink.flush(100).await.unwrap(), 100);

        let snap = sink.metrics();
        assert_eq!(snap.rows_emitted, 3);
        assert_eq!(snap.emit_calls, 2);
        assert_eq!(snap.flushed_ts, 100);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_use() {
        let sink = BlackholeSink::new();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(matches!(
            sink.emit_rows(&[]).await.unwrap_err(),
            SinkError::Closed
        ));
    }
}
