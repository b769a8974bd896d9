//! Table scheduling: applying the owner's add/delete operations.
//!
//! Runs inside the status writer's CAS pass, under the processor state lock
//! (never across an await). Deletes are gated twice: the operation's
//! boundary must be checkpointed before the stop begins, and the drained
//! watermark the rectifier actually stopped at must be checkpointed before
//! the table is physically removed.

use std::sync::Arc;

use drift_model::{OperationStatus, ReplicaInfo, TableId, TaskStatus};

use crate::error::ProcessorError;
use crate::processor::{Processor, ProcessorState};
use crate::table::TableCell;

/// What one scheduler pass decided.
pub(crate) struct SchedulerOutcome {
    /// Tables whose delete completed; physically removed after the status
    /// write lands.
    pub(crate) to_remove: Vec<TableId>,
    /// Done signals consumed from the channel this pass. Re-queued by the
    /// caller if the status write loses its CAS race, so no signal is lost.
    pub(crate) op_done_acks: Vec<TableId>,
}

impl Processor {
    /// Apply every unfinished operation in `status` against the live table
    /// set.
    pub(crate) fn handle_tables_locked(
        self: &Arc<Self>,
        state: &mut ProcessorState,
        status: &mut TaskStatus,
    ) -> Result<SchedulerOutcome, ProcessorError> {
        let mut to_remove = Vec::new();
        let mut op_done_acks = Vec::new();
        let mut op_ids: Vec<TableId> = status.operation.keys().copied().collect();
        op_ids.sort_unstable();

        for table_id in op_ids {
            let op = status.operation[&table_id];
            if op.processed() {
                continue;
            }

            if op.delete {
                if op.boundary_ts > state.position.checkpoint_ts {
                    // Not safe to stop yet; revisit once the checkpoint
                    // crosses the boundary.
                    continue;
                }
                let Some(cell) = state.tables.get(&table_id) else {
                    tracing::warn!(
                        changefeed = %self.changefeed_id,
                        table_id,
                        "table to delete not found, finishing operation"
                    );
                    let op = status.operation.get_mut(&table_id).unwrap();
                    op.done = true;
                    op.status = OperationStatus::Finished;
                    status.dirty = true;
                    continue;
                };
                let (stopped, drained_ts) = cell.safe_stop();
                tracing::debug!(
                    changefeed = %self.changefeed_id,
                    table_id,
                    stopped,
                    drained_ts,
                    "safe-stop table"
                );
                if stopped {
                    let op = status.operation.get_mut(&table_id).unwrap();
                    op.boundary_ts = drained_ts;
                    if drained_ts <= state.position.checkpoint_ts {
                        to_remove.push(table_id);
                        op.done = true;
                        op.status = OperationStatus::Finished;
                    }
                    status.dirty = true;
                }
            } else {
                let Some(replica) = status.tables.get(&table_id).copied() else {
                    return Err(ProcessorError::TableNotFound(table_id));
                };
                if self.config.cyclic_enabled && replica.mark_table_id == 0 {
                    return Err(ProcessorError::MarkTableNotFound(table_id));
                }
                self.add_table_locked(state, table_id, replica);
                let op = status.operation.get_mut(&table_id).unwrap();
                op.status = OperationStatus::Processed;
                status.dirty = true;
            }
        }

        // Collect completion signals from table pipelines, non-blocking.
        {
            let mut op_done_rx = self.op_done_rx.lock().unwrap();
            while let Ok(table_id) = op_done_rx.try_recv() {
                tracing::debug!(
                    changefeed = %self.changefeed_id,
                    table_id,
                    "operation done signal received"
                );
                op_done_acks.push(table_id);
                match status.operation.get_mut(&table_id) {
                    Some(op) => {
                        op.done = true;
                        op.status = OperationStatus::Finished;
                        status.dirty = true;
                    }
                    // Mark tables report too but carry no operation.
                    None => tracing::debug!(
                        changefeed = %self.changefeed_id,
                        table_id,
                        "no operation for done signal, ignoring"
                    ),
                }
            }
        }

        if !status.operation.is_empty() && !status.some_operations_unapplied() {
            status.operation.clear();
            status.dirty = true;
        }
        Ok(SchedulerOutcome {
            to_remove,
            op_done_acks,
        })
    }

    /// Install one table pipeline.
    pub(crate) fn add_table_locked(
        self: &Arc<Self>,
        state: &mut ProcessorState,
        table_id: TableId,
        replica: ReplicaInfo,
    ) {
        let table_name = self
            .schema
            .last_snapshot()
            .table_name(table_id)
            .unwrap_or_else(|| table_id.to_string());

        if let Some(existing) = state.tables.get(&table_id).cloned() {
            if existing.clear_dying() {
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    table_id,
                    "table exists but is dying, cancelling it and reinstalling"
                );
                existing.cancel();
                let old_mark = existing.mark_table_id();
                if old_mark != 0 {
                    state.mark_table_ids.remove(&old_mark);
                }
            } else {
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    table_id,
                    "ignoring add of live table"
                );
                return;
            }
        }

        let global_checkpoint = self
            .global_checkpoint_ts
            .load(std::sync::atomic::Ordering::Acquire);
        if replica.start_ts < global_checkpoint {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                table_id,
                start_ts = replica.start_ts,
                checkpoint = global_checkpoint,
                "table start_ts below global checkpoint"
            );
        }

        tracing::debug!(
            changefeed = %self.changefeed_id,
            table_id,
            table = %table_name,
            start_ts = replica.start_ts,
            mark_table_id = replica.mark_table_id,
            "adding table"
        );

        let cancel = self.cancel.child_token();
        let cell = Arc::new(TableCell::new(
            table_id,
            table_name,
            replica.start_ts,
            cancel,
        ));

        // Mark tables are listened to once, share the owner's cancel token
        // and are never independently scheduled.
        if self.config.cyclic_enabled && replica.mark_table_id != 0 {
            let mark_id = replica.mark_table_id;
            if state.mark_table_ids.insert(mark_id) {
                cell.enable_mark(mark_id, replica.start_ts);
                self.spawn_table_pipeline(
                    mark_id,
                    replica.start_ts,
                    cell.mark_resolved_cell(),
                    cell.cancel_token(),
                );
            }
        }

        // A table starting below the current position legitimately lowers
        // it; the output merger tolerates the fallback.
        if state.position.checkpoint_ts > replica.start_ts {
            state.position.checkpoint_ts = replica.start_ts;
        }
        if state.position.resolved_ts > replica.start_ts {
            state.position.resolved_ts = replica.start_ts;
        }
        self.local_resolved_ts.store(
            state.position.resolved_ts,
            std::sync::atomic::Ordering::Release,
        );

        if let Some(rectifier) = self.spawn_table_pipeline(
            table_id,
            replica.start_ts,
            cell.resolved_cell(),
            cell.cancel_token(),
        ) {
            cell.set_rectifier(rectifier);
        }
        state.tables.insert(table_id, cell);
        self.metrics.table_count.store(
            state.tables.len() as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    /// Physically remove a table whose delete completed.
    pub(crate) fn remove_table(&self, table_id: TableId) {
        let mut state = self.state.lock().unwrap();
        tracing::debug!(changefeed = %self.changefeed_id, table_id, "removing table");

        let Some(cell) = state.tables.get(&table_id).cloned() else {
            tracing::warn!(changefeed = %self.changefeed_id, table_id, "table to remove not found");
            return;
        };
        // Only dying tables are removed; a concurrent re-add already took
        // the cell over.
        if !cell.clear_dying() {
            return;
        }
        cell.cancel();
        state.tables.remove(&table_id);
        let mark_id = cell.mark_table_id();
        if mark_id != 0 {
            state.mark_table_ids.remove(&mark_id);
        }
        self.metrics.table_count.store(
            state.tables.len() as u64,
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    /// Cancel every table pipeline; used on processor stop. Mark tables
    /// share their owner's token and need no separate cancel.
    pub(crate) fn cancel_all_tables(&self) {
        let state = self.state.lock().unwrap();
        for cell in state.tables.values() {
            cell.cancel();
        }
    }
}
