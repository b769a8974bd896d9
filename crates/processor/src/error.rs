//! Processor error types.
//!
//! Every fatal error carries an RFC-style code that is recorded in the
//! persisted `TaskPosition.error` before the processor tears down, so the
//! owner can tell captures' failure modes apart without log access.

use thiserror::Error;

use drift_coord::StoreError;
use drift_model::TableId;
use drift_pipeline::PipelineError;
use drift_sinks::SinkError;

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The owner put this capture's task into a stop state; the processor
    /// flushes its position once more and tears down.
    #[error("processor stopped by admin command")]
    AdminStop,

    /// Cooperative cancellation; exits are silent.
    #[error("cancelled")]
    Cancelled,

    /// An Add operation had no matching replica info in the task status.
    #[error("replica info of table {0} not found in task status")]
    TableNotFound(TableId),

    /// Cyclic replication requires every user table to carry a mark table.
    #[error("table {0} has no mark table in cyclic mode")]
    MarkTableNotFound(TableId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Other(String),
}

impl ProcessorError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Pipeline(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// RFC-style code recorded in `TaskPosition.error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdminStop => "CDC:ErrAdminStopProcessor",
            Self::Cancelled => "CDC:ErrProcessorCancelled",
            Self::TableNotFound(_) | Self::MarkTableNotFound(_) => {
                "CDC:ErrProcessorTableNotFound"
            }
            Self::Store(StoreError::Conflict { .. }) => "CDC:ErrCoordinationStoreConflict",
            Self::Store(StoreError::Compacted { .. }) => "CDC:ErrCoordinationStoreCompacted",
            Self::Store(_) => "CDC:ErrCoordinationStore",
            Self::Pipeline(PipelineError::UnknownSortEngine(_)) => "CDC:ErrUnknownSortEngine",
            Self::Pipeline(PipelineError::SortDir { .. }) => "CDC:ErrProcessorSortDir",
            Self::Pipeline(_) => "CDC:ErrProcessorPipeline",
            Self::Sink(_) => "CDC:ErrProcessorSink",
            Self::Other(_) => "CDC:ErrProcessorUnknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_silent_at_both_layers() {
        assert!(ProcessorError::Cancelled.is_cancelled());
        assert!(ProcessorError::Pipeline(PipelineError::Cancelled).is_cancelled());
        assert!(!ProcessorError::AdminStop.is_cancelled());
    }

    #[test]
    fn test_codes() {
        assert_eq!(ProcessorError::AdminStop.code(), "CDC:ErrAdminStopProcessor");
        assert_eq!(
            ProcessorError::TableNotFound(7).code(),
            "CDC:ErrProcessorTableNotFound"
        );
        let conflict = ProcessorError::Store(StoreError::Conflict {
            key: "/task/status/cf/cap".into(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(conflict.code(), "CDC:ErrCoordinationStoreConflict");
    }
}
