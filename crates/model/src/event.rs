//! The polymorphic pipeline event.
//!
//! A single `Event` type flows through the sorter, rectifier, mounter and
//! output queue; readers branch on whether it is a row mutation or a
//! watermark. Because the same event is handed to both the mounter pool and
//! the output queue, events travel as `Arc<Event>` and carry their decoded
//! row and readiness latch behind interior mutability.

use std::fmt;
use std::sync::OnceLock;

use tokio::sync::watch;

use crate::raw::RawEntry;
use crate::row::RowChange;
use crate::ts::Ts;
use crate::RegionId;

/// A row mutation or watermark moving through the per-table pipeline.
pub struct Event {
    pub commit_ts: Ts,
    pub start_ts: Ts,
    /// The undecoded upstream entry. Always present; watermark events carry
    /// a `Resolved` entry.
    pub raw: RawEntry,
    /// Decoded row, attached by the mounter. `Some(None)` once decoding has
    /// run and failed (the row is skipped downstream).
    row: OnceLock<Option<RowChange>>,
    /// Single-shot readiness latch, armed before the event enters the
    /// mounter and fired when decoding completes. Un-armed events are
    /// always ready.
    prepared: OnceLock<watch::Sender<bool>>,
}

impl Event {
    pub fn from_raw(raw: RawEntry) -> Self {
        Self {
            commit_ts: raw.commit_ts,
            start_ts: raw.start_ts,
            raw,
            row: OnceLock::new(),
            prepared: OnceLock::new(),
        }
    }

    /// A watermark event. `region_id` 0 marks events produced by the
    /// processor itself (the global watermark fan-out).
    pub fn resolved(region_id: RegionId, ts: Ts) -> Self {
        Self::from_raw(RawEntry::resolved(region_id, ts))
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.raw.is_resolved()
    }

    /// Arm the readiness latch. Called once, before handing the event to the
    /// mounter; arming twice is a no-op.
    pub fn arm_prepared(&self) {
        let (tx, _rx) = watch::channel(false);
        let _ = self.prepared.set(tx);
    }

    /// Fire the readiness latch. No-op if the latch was never armed.
    pub fn mark_prepared(&self) {
        if let Some(tx) = self.prepared.get() {
            let _ = tx.send(true);
        }
    }

    /// Wait until the mounter has finished with this event. Returns
    /// immediately if the latch was never armed or has already fired.
    pub async fn wait_prepared(&self) {
        if let Some(tx) = self.prepared.get() {
            let mut rx = tx.subscribe();
            // The sender lives inside `self`, so the only way this errors is
            // the event being dropped mid-wait, which cannot happen while we
            // hold `&self`.
            let _ = rx.wait_for(|ready| *ready).await;
        }
    }

    /// Attach the decode result. `None` records a decode failure (the row is
    /// skipped). Only the first call wins.
    pub fn set_row(&self, row: Option<RowChange>) {
        let _ = self.row.set(row);
    }

    /// The decoded row, if the mounter produced one.
    pub fn row(&self) -> Option<&RowChange> {
        self.row.get().and_then(|r| r.as_ref())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("commit_ts", &self.commit_ts)
            .field("start_ts", &self.start_ts)
            .field("op", &self.raw.op)
            .field("decoded", &self.row.get().map(|r| r.is_some()))
            .finish()
    }
}
