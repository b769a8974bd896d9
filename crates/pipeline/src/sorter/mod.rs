//! Ordering stage.
//!
//! Sorters accept raw-order events and emit them in non-decreasing
//! `commit_ts`, flushing everything at or below each incoming watermark.
//! Engines:
//!
//! - `inMemory` ([`MemorySorter`]): sort-on-resolved in RAM
//! - `onDisk` ([`FileSorter`] with no resident budget): every batch passes
//!   through spill files in the sort directory
//! - `unified` ([`FileSorter`] with a resident budget): RAM until the budget
//!   is exceeded, spill files past it

mod file;
mod memory;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::Event;

use crate::error::PipelineError;

pub use file::FileSorter;
pub use memory::MemorySorter;

/// Resident bytes the `unified` engine keeps before spilling.
const UNIFIED_SPILL_BYTES: usize = 512 * 1024 * 1024;

/// An ordering stage between puller and rectifier.
#[async_trait]
pub trait EventSorter: Send + Sync + 'static {
    /// Queue one event. Watermarks trigger a flush of everything at or
    /// below them.
    async fn add_entry(&self, event: Arc<Event>);

    /// Drive sorting until cancelled or the output consumer goes away.
    async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError>;

    /// Take the single sorted output stream.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    fn take_output(&self) -> mpsc::Receiver<Arc<Event>>;
}

/// Sorter backend selector (config option `sort_engine`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortEngine {
    InMemory,
    OnDisk,
    Unified,
}

impl FromStr for SortEngine {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inMemory" => Ok(Self::InMemory),
            "onDisk" => Ok(Self::OnDisk),
            "unified" => Ok(Self::Unified),
            other => Err(PipelineError::UnknownSortEngine(other.to_string())),
        }
    }
}

impl std::fmt::Display for SortEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::InMemory => "inMemory",
            Self::OnDisk => "onDisk",
            Self::Unified => "unified",
        })
    }
}

/// Construct the sorter for one table pipeline.
///
/// Disk-backed engines create `sort_dir` (mode `0o755`) when missing and
/// verify it is writable; failures are fatal to the processor.
pub fn build_sorter(engine: SortEngine, sort_dir: &Path) -> Result<Arc<dyn EventSorter>, PipelineError> {
    match engine {
        SortEngine::InMemory => Ok(Arc::new(MemorySorter::new())),
        SortEngine::OnDisk => {
            prepare_sort_dir(sort_dir)?;
            Ok(Arc::new(FileSorter::new(sort_dir, 0)))
        }
        SortEngine::Unified => {
            prepare_sort_dir(sort_dir)?;
            Ok(Arc::new(FileSorter::new(sort_dir, UNIFIED_SPILL_BYTES)))
        }
    }
}

fn prepare_sort_dir(dir: &Path) -> Result<(), PipelineError> {
    let sort_dir_err = |source: std::io::Error| PipelineError::SortDir {
        path: dir.to_path_buf(),
        source,
    };

    if !dir.exists() {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder.create(dir).map_err(sort_dir_err)?;
    }

    // Probe writability up front so a read-only mount fails at construction,
    // not at first spill.
    let probe = dir.join(".drift-writable-check");
    std::fs::write(&probe, b"ok").map_err(sort_dir_err)?;
    std::fs::remove_file(&probe).map_err(sort_dir_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_from_str() {
        assert_eq!("inMemory".parse::<SortEngine>().unwrap(), SortEngine::InMemory);
        assert_eq!("onDisk".parse::<SortEngine>().unwrap(), SortEngine::OnDisk);
        assert_eq!("unified".parse::<SortEngine>().unwrap(), SortEngine::Unified);

        let err = "bubble".parse::<SortEngine>().unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSortEngine(ref e) if e == "bubble"));
    }

    #[test]
    fn test_build_creates_sort_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("sort");
        assert!(!dir.exists());
        build_sorter(SortEngine::Unified, &dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_unusable_sort_dir_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the directory should be.
        let dir = tmp.path().join("occupied");
        std::fs::write(&dir, b"not a directory").unwrap();

        let result = build_sorter(SortEngine::OnDisk, &dir);
        assert!(matches!(result, Err(PipelineError::SortDir { .. })));
    }
}
