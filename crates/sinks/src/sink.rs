//! The sink contract.

use async_trait::async_trait;
use thiserror::Error;

use drift_model::{RowChange, Ts};

/// Sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Sink initialization failed.
    #[error("failed to initialize sink: {0}")]
    Init(String),

    /// Appending rows failed.
    #[error("emit failed: {0}")]
    Emit(String),

    /// Durable commit failed.
    #[error("flush failed: {0}")]
    Flush(String),

    /// The sink was used after `close`.
    #[error("sink closed")]
    Closed,

    /// I/O error from the backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    pub fn emit(msg: impl Into<String>) -> Self {
        Self::Emit(msg.into())
    }

    pub fn flush(msg: impl Into<String>) -> Self {
        Self::Flush(msg.into())
    }
}

/// Downstream delivery target for decoded row changes.
///
/// Implementations must treat `emit_rows` as an atomic append in call order
/// and must never report a flush timestamp above the requested target.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Append rows to the sink's buffer. Blocking; may be called with an
    /// empty slice.
    async fn emit_rows(&self, rows: &[RowChange]) -> Result<(), SinkError>;

    /// Durably commit all previously emitted rows with
    /// `commit_ts <= target_ts`. Returns the timestamp actually durable,
    /// at most `target_ts`; `0` means nothing is durable yet.
    async fn flush(&self, target_ts: Ts) -> Result<Ts, SinkError>;

    /// Release the sink. Idempotent.
    async fn close(&self) -> Result<(), SinkError>;
}
