//! Decoded row-change events, as delivered to sinks.

use serde::{Deserialize, Serialize};

use crate::ts::Ts;
use crate::TableId;

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: serde_json::Value,
}

impl Column {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A fully decoded row mutation, produced by the mounter from a raw entry
/// and a schema snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table_id: TableId,
    pub schema: String,
    pub table: String,
    pub commit_ts: Ts,
    pub start_ts: Ts,
    /// Integer row handle extracted from the key.
    pub handle: i64,
    pub is_delete: bool,
    /// Column values after the mutation. Empty for deletes.
    pub columns: Vec<Column>,
    /// Column values before the mutation, present when old-value capture is
    /// enabled upstream.
    pub pre_columns: Option<Vec<Column>>,
}

impl RowChange {
    /// Hash of the row key, used for sink partitioning.
    pub fn key_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.table_id.hash(&mut h);
        self.handle.hash(&mut h);
        h.finish()
    }
}
