//! Changefeed configuration.
//!
//! All fields default sensibly; embedders only set what they change. The
//! struct deserializes from the changefeed's stored config document.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use drift_pipeline::{PipelineError, SortEngine};

/// Sorted-but-unmounted backlog the output queue can absorb. Sized for the
/// 50-100k QPS range, where 200k-400k events accumulate between sort and
/// mount in a busy changefeed.
pub const DEFAULT_OUTPUT_CHANNEL_SIZE: usize = 1 << 20;

/// Default puller memory budget (10 GiB).
pub const DEFAULT_MEM_BUFFER_BYTES: usize = 10 * 1024 * 1024 * 1024;

/// Default mounter pool size.
pub const DEFAULT_MOUNTER_WORKERS: usize = 16;

/// Default shared mounter input queue length.
pub const DEFAULT_MOUNTER_INPUT_SIZE: usize = 4096;

/// Per-changefeed processor options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChangefeedConfig {
    /// Sorter backend: `inMemory`, `onDisk` or `unified`.
    pub sort_engine: String,

    /// Directory for sorter spill files (disk-backed engines only).
    /// Created with mode `0o755` when missing; must be writable.
    pub sort_dir: PathBuf,

    /// Whether key-ranges include old values.
    pub enable_old_value: bool,

    /// Cyclic replication: every user table carries a paired mark table and
    /// Add operations require a non-zero mark table id.
    pub cyclic_enabled: bool,

    /// Mounter pool size.
    pub mounter_worker_num: usize,

    /// Minimum interval between checkpoint persistences, in milliseconds.
    /// `0` persists on every checkpoint tick. Resolved-ts advancement is
    /// never throttled by this.
    pub flush_checkpoint_interval_ms: u64,

    /// Output queue capacity between the sorters and the sink merger.
    pub output_channel_size: usize,

    /// Shared mounter input queue capacity.
    pub mounter_input_size: usize,

    /// Byte budget for puller buffers (the blur limiter).
    pub mem_buffer_bytes: usize,
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            sort_engine: "unified".into(),
            sort_dir: std::env::temp_dir().join("drift-sort"),
            enable_old_value: false,
            cyclic_enabled: false,
            mounter_worker_num: DEFAULT_MOUNTER_WORKERS,
            flush_checkpoint_interval_ms: 0,
            output_channel_size: DEFAULT_OUTPUT_CHANNEL_SIZE,
            mounter_input_size: DEFAULT_MOUNTER_INPUT_SIZE,
            mem_buffer_bytes: DEFAULT_MEM_BUFFER_BYTES,
        }
    }
}

impl ChangefeedConfig {
    /// Parse the configured sort engine. Unknown engines are fatal at
    /// processor construction.
    pub fn sort_engine(&self) -> Result<SortEngine, PipelineError> {
        self.sort_engine.parse()
    }

    pub fn flush_checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.flush_checkpoint_interval_ms)
    }

    /// Validate everything that must hold before a processor is built.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.sort_engine()?;
        Ok(())
    }
}
