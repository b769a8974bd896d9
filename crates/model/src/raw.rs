//! Raw key-value entries from the upstream event source.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ts::Ts;
use crate::RegionId;

/// Kind of mutation carried by a [`RawEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Put,
    Delete,
    /// Watermark carrier: no entry with `commit_ts` at or below this entry's
    /// `commit_ts` will ever be produced on the same region again.
    Resolved,
}

/// A single mutation (or watermark) as delivered by the upstream source.
///
/// The upstream source never emits a Resolved entry whose `commit_ts` is
/// below any previously emitted entry's `commit_ts` on the same region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntry {
    pub op: OpType,
    pub key: Bytes,
    pub value: Bytes,
    /// Previous value of the key, present when old-value capture is enabled.
    pub old_value: Option<Bytes>,
    pub start_ts: Ts,
    pub commit_ts: Ts,
    pub region_id: RegionId,
}

impl RawEntry {
    /// A watermark entry for the given region.
    pub fn resolved(region_id: RegionId, ts: Ts) -> Self {
        Self {
            op: OpType::Resolved,
            key: Bytes::new(),
            value: Bytes::new(),
            old_value: None,
            start_ts: 0,
            commit_ts: ts,
            region_id,
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.op == OpType::Resolved
    }

    /// Approximate heap footprint, used for memory accounting in pullers.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + self.old_value.as_ref().map_or(0, |v| v.len()) + 48
    }
}
