//! Pipeline error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration named a sort engine this build does not know.
    #[error("unknown sort engine: {0}")]
    UnknownSortEngine(String),

    /// The sort directory is missing, not creatable, or not writable.
    #[error("sort dir {path}: {source}")]
    SortDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Schema storage failed; decoding cannot proceed.
    #[error("schema storage: {0}")]
    Schema(String),

    /// Applying a DDL job to the schema storage failed.
    #[error("ddl job {job_id}: {message}")]
    DdlApply { job_id: i64, message: String },

    /// Spill file I/O failed.
    #[error("sorter spill: {0}")]
    Spill(#[from] std::io::Error),

    /// Spill file contents failed to decode.
    #[error("sorter spill decode: {0}")]
    SpillDecode(#[from] serde_json::Error),

    /// A stage's inter-task channel closed underneath it.
    #[error("pipeline channel closed")]
    ChannelClosed,

    /// Cooperative cancellation; exits are silent.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
