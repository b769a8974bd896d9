//! Drift - Core data model
//!
//! Shared types for the CDC processor: hybrid logical timestamps, the raw
//! upstream KV entry, the polymorphic pipeline event, decoded row changes,
//! DDL jobs, and the task/changefeed state persisted to the coordination
//! store.
//!
//! # Layout
//!
//! ```text
//! RawEntry ──(sort/rectify)──> Event ──(mount)──> RowChange ──> Sink
//!                                │
//!                                └── prepared latch, fired by the mounter
//! ```
//!
//! Everything that crosses the coordination store (`TaskStatus`,
//! `TaskPosition`, `TaskWorkload`, `ChangeFeedStatus`) is serde-serializable
//! and stored as JSON.

mod capture;
mod codec;
mod ddl;
mod event;
mod raw;
mod row;
mod task;
pub mod ts;

pub use capture::{CaptureInfo, ChangefeedInfo};
pub use codec::{
    decode_ddl_job, decode_row_key, decode_row_value, encode_ddl_value, encode_row_key,
    encode_row_value, table_id_from_key, CodecError, DDL_KEY_PREFIX, ROW_KEY_PREFIX,
};
pub use ddl::{DdlJob, DdlJobType};
pub use event::Event;
pub use raw::{OpType, RawEntry};
pub use row::{Column, RowChange};
pub use task::{
    AdminJobType, ChangeFeedStatus, OperationStatus, ReplicaInfo, RunningError, TableOperation,
    TaskPosition, TaskStatus, TaskWorkload, WorkloadInfo,
};
pub use ts::Ts;

/// Table identifier as assigned by the upstream store.
pub type TableId = i64;

/// Upstream region identifier carried on raw entries.
pub type RegionId = u64;
