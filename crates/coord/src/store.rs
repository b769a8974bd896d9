//! The store contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// A stored value together with its modification revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub value: Vec<u8>,
    /// Store-wide revision at which this key was last written.
    pub mod_revision: i64,
}

/// One observed change on a watched key.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete,
    /// The watch fell behind the store's compaction floor; the consumer must
    /// re-read the key and re-watch from the fresh revision.
    Compacted,
}

/// Replicated KV store with CAS-by-revision writes and revision-anchored
/// watches.
///
/// All cross-capture state lives here; the processor itself keeps only
/// process-local state. Implementations must provide a single total order of
/// writes (the revision) and deliver watch events for a key in that order.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Read a key. `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Unconditional write. Returns the new modification revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError>;

    /// Guarded write: succeeds only if the key's current modification
    /// revision equals `expected_mod_revision` (`0` = key must not exist).
    /// Returns the new revision, or [`StoreError::Conflict`].
    async fn cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> Result<i64, StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Watch a single key, replaying history from `from_revision`
    /// (exclusive of nothing: events with `revision >= from_revision` are
    /// delivered). A `from_revision` at or below the compaction floor yields
    /// a single [`WatchEvent::Compacted`].
    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError>;
}
