//! Task and changefeed state persisted to the coordination store.
//!
//! `TaskStatus` is CAS-written by the processor and by the owner;
//! `TaskPosition` is written by the processor on watermark advancement;
//! `ChangeFeedStatus` is owner-written and read-only here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ts::Ts;
use crate::TableId;

/// Per-table replication parameters, owner-assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub start_ts: Ts,
    /// Paired mark table in cyclic mode; `0` when cyclic replication is off.
    #[serde(default)]
    pub mark_table_id: TableId,
}

/// Progress of a scheduling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OperationStatus {
    #[default]
    Dispatched,
    Processed,
    Finished,
}

/// A pending add or delete of one table on this capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableOperation {
    pub delete: bool,
    /// For deletes: events up to this timestamp must be flushed before the
    /// table leaves; rewritten to the drained watermark once the pipeline
    /// stops. For adds: informational.
    #[serde(default)]
    pub boundary_ts: Ts,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub status: OperationStatus,
}

impl TableOperation {
    /// The operation has fully taken effect.
    #[inline]
    pub fn applied(&self) -> bool {
        self.status == OperationStatus::Finished
    }

    /// The operation has at least been picked up by the processor.
    #[inline]
    pub fn processed(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Processed | OperationStatus::Finished
        )
    }
}

/// Administrative job state pushed down by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AdminJobType {
    #[default]
    None,
    Stop,
    Resume,
    Remove,
    Finish,
}

impl AdminJobType {
    /// Whether this admin state requires the processor to stop.
    pub fn is_stop_state(&self) -> bool {
        matches!(self, Self::Stop | Self::Remove | Self::Finish)
    }
}

/// The owner-assigned table set and pending operations for one capture,
/// CAS-written with the key's modification revision as the guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub tables: HashMap<TableId, ReplicaInfo>,
    #[serde(default)]
    pub operation: HashMap<TableId, TableOperation>,
    #[serde(default)]
    pub admin_job_type: AdminJobType,
    /// In-memory only: set when the scheduler mutated this status and it
    /// must be written back.
    #[serde(skip)]
    pub dirty: bool,
}

impl TaskStatus {
    /// Whether any operation still awaits its `Finished` transition.
    pub fn some_operations_unapplied(&self) -> bool {
        self.operation.values().any(|op| !op.applied())
    }
}

/// Fatal error recorded alongside the task position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningError {
    pub addr: String,
    pub code: String,
    pub message: String,
}

/// This capture's replication progress, persisted on advancement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPosition {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunningError>,
}

impl TaskPosition {
    pub fn new(checkpoint_ts: Ts) -> Self {
        Self {
            checkpoint_ts,
            resolved_ts: 0,
            error: None,
        }
    }
}

/// Owner-published changefeed-wide watermarks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFeedStatus {
    pub resolved_ts: Ts,
    pub checkpoint_ts: Ts,
}

/// Per-table load estimate reported for rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub workload: u64,
}

/// Workload report for all tables owned by one capture.
pub type TaskWorkload = HashMap<TableId, WorkloadInfo>;
