//! Per-table state and pipeline tasks.
//!
//! A [`TableCell`] is the processor's handle on one owned table: its
//! watermark cells, its dying flag, its cancel token and its rectifier. The
//! pipeline behind it (puller -> sorter -> rectifier plus the two consumer
//! tasks) is spawned here; all tasks hang off the table's own child token so
//! deleting one table never disturbs its siblings.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::{Event, RawEntry, TableId, Ts, WorkloadInfo};
use drift_pipeline::span::table_span;
use drift_pipeline::{build_sorter, Rectifier};

use crate::processor::Processor;

/// One owned table.
pub(crate) struct TableCell {
    pub(crate) id: TableId,
    /// Qualified table name; logging only.
    pub(crate) name: String,
    resolved_ts: Arc<AtomicU64>,
    mark_table_id: AtomicI64,
    mark_resolved_ts: Arc<AtomicU64>,
    is_dying: AtomicBool,
    cancel: CancellationToken,
    rectifier: OnceLock<Arc<Rectifier>>,
}

impl TableCell {
    pub(crate) fn new(id: TableId, name: String, start_ts: Ts, cancel: CancellationToken) -> Self {
        Self {
            id,
            name,
            resolved_ts: Arc::new(AtomicU64::new(start_ts)),
            mark_table_id: AtomicI64::new(0),
            mark_resolved_ts: Arc::new(AtomicU64::new(0)),
            is_dying: AtomicBool::new(false),
            cancel,
            rectifier: OnceLock::new(),
        }
    }

    /// Register the paired mark table; its watermark participates in the
    /// effective watermark from here on.
    pub(crate) fn enable_mark(&self, mark_table_id: TableId, start_ts: Ts) {
        self.mark_table_id.store(mark_table_id, Ordering::Release);
        self.mark_resolved_ts.store(start_ts, Ordering::Release);
    }

    pub(crate) fn mark_table_id(&self) -> TableId {
        self.mark_table_id.load(Ordering::Acquire)
    }

    /// Watermark for the sink: the table's own resolved ts, clamped by the
    /// mark table's when one is attached.
    pub(crate) fn effective_resolved_ts(&self) -> Ts {
        let resolved = self.resolved_ts.load(Ordering::Acquire);
        if self.mark_table_id() != 0 {
            resolved.min(self.mark_resolved_ts.load(Ordering::Acquire))
        } else {
            resolved
        }
    }

    pub(crate) fn resolved_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.resolved_ts)
    }

    pub(crate) fn mark_resolved_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.mark_resolved_ts)
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.is_dying.load(Ordering::Acquire)
    }

    /// Clear the dying flag, returning whether it was set. Removal and
    /// re-add both need the previous value to decide what to do.
    pub(crate) fn clear_dying(&self) -> bool {
        self.is_dying.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_rectifier(&self, rectifier: Arc<Rectifier>) {
        let _ = self.rectifier.set(rectifier);
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn workload(&self) -> WorkloadInfo {
        // Constant estimate until per-table load accounting lands upstream.
        WorkloadInfo { workload: 1 }
    }

    /// Begin (or continue) a safe stop. Returns `(true, drained_ts)` once
    /// the rectifier has reached a terminal state; the scheduler then gates
    /// physical removal on `drained_ts` being checkpointed.
    pub(crate) fn safe_stop(&self) -> (bool, Ts) {
        self.is_dying.store(true, Ordering::Release);
        let Some(rectifier) = self.rectifier.get() else {
            // Pipeline construction failed; nothing to drain.
            return (true, self.resolved_ts.load(Ordering::Acquire));
        };
        rectifier.safe_stop();
        if !rectifier.status().is_terminal() {
            return (false, 0);
        }
        (true, rectifier.max_resolved_ts())
    }
}

impl Processor {
    /// Build and launch one table (or mark-table) pipeline. Construction
    /// failures are reported to the error channel and yield `None`, exactly
    /// like any other fatal processor error.
    pub(crate) fn spawn_table_pipeline(
        self: &Arc<Self>,
        table_id: TableId,
        start_ts: Ts,
        resolved_cell: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Option<Arc<Rectifier>> {
        let sorter = match build_sorter(self.sort_engine, &self.config.sort_dir) {
            Ok(sorter) => sorter,
            Err(e) => {
                self.report_err(e.into());
                return None;
            }
        };
        let puller = self.puller_factory.create(
            vec![table_span(table_id, self.config.enable_old_value)],
            start_ts,
            Arc::clone(&self.limiter),
            self.config.enable_old_value,
        );
        let rectifier = Arc::new(Rectifier::new(sorter, self.target_ts));

        let puller_rx = puller.take_output();
        let rectifier_rx = rectifier.take_output();

        {
            let this = Arc::clone(self);
            let puller = Arc::clone(&puller);
            let token = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = puller.run(token).await {
                    this.report_err(e.into());
                }
            });
        }
        {
            let this = Arc::clone(self);
            let rectifier = Arc::clone(&rectifier);
            let token = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = rectifier.run(token).await {
                    this.report_err(e.into());
                }
            });
        }
        {
            let this = Arc::clone(self);
            let rectifier = Arc::clone(&rectifier);
            let token = cancel.clone();
            tokio::spawn(async move {
                this.puller_consume(puller_rx, rectifier, token).await;
            });
        }
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.sorter_consume(rectifier_rx, table_id, start_ts, resolved_cell, cancel)
                    .await;
            });
        }

        Some(rectifier)
    }

    /// Move raw entries from the puller into the sorter, returning their
    /// bytes to the limiter as they leave the puller buffer.
    async fn puller_consume(
        &self,
        mut rx: mpsc::Receiver<RawEntry>,
        rectifier: Arc<Rectifier>,
        cancel: CancellationToken,
    ) {
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => return,
                entry = rx.recv() => match entry {
                    Some(entry) => entry,
                    None => return,
                },
            };
            let size = entry.size();
            rectifier.add_entry(Arc::new(Event::from_raw(entry))).await;
            self.limiter.release(size);
        }
    }

    /// Consume the rectifier's gated output: hand every event to the
    /// mounter, publish watermarks to the table's cell, forward rows to the
    /// output queue, and drive the add-done protocol.
    async fn sorter_consume(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Arc<Event>>,
        table_id: TableId,
        start_ts: Ts,
        resolved_cell: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) {
        let mut last_resolved: Ts = 0;
        let mut op_done = false;
        let mounter_input = self.mounter.input();
        let mut check_ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        check_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = check_ticker.tick(), if !op_done => {
                    op_done = self.check_op_done(table_id, last_resolved, &cancel).await;
                    continue;
                }
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    // Rectifier reached a terminal state.
                    None => return,
                },
            };

            event.arm_prepared();
            let to_mounter = Arc::clone(&event);
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = mounter_input.send(to_mounter) => {
                    if res.is_err() {
                        return;
                    }
                }
            }

            if event.is_resolved() {
                resolved_cell.fetch_max(event.commit_ts, Ordering::AcqRel);
                last_resolved = event.commit_ts;
                self.local_resolved_notifier.notify();
                if !op_done {
                    op_done = self.check_op_done(table_id, last_resolved, &cancel).await;
                }
                continue;
            }

            if event.commit_ts <= last_resolved || event.commit_ts < start_ts {
                panic!(
                    "sorted event out of order: table {} commit_ts {} resolved {} start_ts {}",
                    table_id, event.commit_ts, last_resolved, start_ts
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                res = self.output_tx.send(event) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// The add-done protocol: signal the scheduler once
    /// `table >= local >= global` holds. Signalled at most once per table
    /// pipeline; re-checked on every watermark and a 1 s ticker until then.
    async fn check_op_done(
        &self,
        table_id: TableId,
        table_resolved: Ts,
        cancel: &CancellationToken,
    ) -> bool {
        let local = self.local_resolved_ts.load(Ordering::Acquire);
        let global = self.global_resolved_ts.load(Ordering::Acquire);
        if table_resolved >= local && local >= global {
            tracing::debug!(
                changefeed = %self.changefeed_id,
                table_id,
                table_resolved,
                local,
                global,
                "table caught up, sending operation done"
            );
            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                res = self.op_done_tx.send(table_id) => res.is_ok(),
            };
            if sent {
                // Schedule a status pass so the signal is drained even on an
                // otherwise idle changefeed.
                self.local_resolved_notifier.notify();
            }
            return true;
        }
        tracing::debug!(
            changefeed = %self.changefeed_id,
            table_id,
            table_resolved,
            local,
            global,
            "table add not caught up yet"
        );
        false
    }
}
