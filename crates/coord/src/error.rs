//! Coordination-store error types.

use thiserror::Error;

/// Errors surfaced by [`CoordStore`](crate::CoordStore) implementations and
/// the typed client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A CAS write lost the race: the key's modification revision no longer
    /// matches the guard. Retried with backoff by the caller.
    #[error("revision conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    /// The requested watch revision has been compacted away; the watcher
    /// must re-read from scratch.
    #[error("watch revision {revision} compacted (floor {compacted})")]
    Compacted { revision: i64, compacted: i64 },

    /// A key the caller requires unconditionally is absent.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Stored payload failed to (de)serialize.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    /// The store backend is gone.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Conflicts are the only transient store error worth retrying in place.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
