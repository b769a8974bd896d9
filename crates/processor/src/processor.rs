//! The processor: construction, long-running workers, lifecycle.
//!
//! One `Processor` replicates one changefeed on one capture. Every worker
//! below is a separate task joined under one supervisor; the first non-
//! cancellation error wins the capacity-1 error channel and cancels the
//! whole scope. Shared scalar watermarks are atomics; everything composite
//! (tables, status, position) lives under the single `state` mutex, which is
//! never held across a suspension point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossfire::{AsyncRx, MAsyncTx};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use drift_coord::{CoordClient, CoordStore, StoreError, WatchEvent};
use drift_model::{
    decode_ddl_job, ts, CaptureInfo, ChangeFeedStatus, ChangefeedInfo, Event, RowChange,
    RunningError, TableId, TaskPosition, TaskStatus, TaskWorkload, Ts,
};
use drift_pipeline::span::ddl_span;
use drift_pipeline::{
    sort_raw_output, MemoryLimiter, Mounter, Notifier, Puller, PullerFactory,
    Receiver as NotifyReceiver, SchemaStorage, SortEngine,
};
use drift_sinks::Sink;

use crate::config::ChangefeedConfig;
use crate::error::ProcessorError;
use crate::metrics::ProcessorMetrics;
use crate::retry::{self, RetryError};
use crate::table::TableCell;

/// Rows buffered by the output merger before a forced emit.
const SYNC_RESOLVED_BATCH: usize = 1024;

/// Debounce for watermark receivers.
const WATERMARK_RECEIVER_INTERVAL: Duration = Duration::from_millis(50);

/// Pacing of the global watermark fan-out into the output queue.
const GLOBAL_FANOUT_INTERVAL: Duration = Duration::from_secs(1);

/// Workload report period.
const WORKLOAD_INTERVAL: Duration = Duration::from_secs(10);

/// Metrics refresh period.
const METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Sink flushes slower than this are logged.
const SLOW_FLUSH_THRESHOLD: Duration = Duration::from_secs(3);

/// Status-write retry policy (CAS conflicts and transient store errors).
const STATUS_RETRY_BASE: Duration = Duration::from_millis(500);
const STATUS_RETRY_ATTEMPTS: usize = 3;

/// Initial changefeed-status read retry budget.
const CHANGEFEED_READ_ATTEMPTS: usize = 5;

/// Schema GC trails the global checkpoint by this long, giving pullers that
/// start from an old timestamp a window to mount against old schemas.
const SCHEMA_GC_LAG_MS: u64 = 20 * 60 * 1000;

static PROCESSOR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything a processor needs from its embedder. The upstream source, the
/// schema service, the sink and the coordination store all arrive as trait
/// objects.
pub struct ProcessorParams {
    pub store: Arc<dyn CoordStore>,
    pub sink: Arc<dyn Sink>,
    pub schema: Arc<dyn SchemaStorage>,
    pub puller_factory: Arc<dyn PullerFactory>,
    pub changefeed_id: String,
    pub capture: CaptureInfo,
    pub changefeed: ChangefeedInfo,
    pub config: ChangefeedConfig,
    /// Replication resumes from here; seeds the checkpoint and the DDL
    /// puller.
    pub checkpoint_ts: Ts,
}

/// Composite state under the single processor mutex.
pub(crate) struct ProcessorState {
    pub(crate) status: TaskStatus,
    pub(crate) position: TaskPosition,
    pub(crate) status_mod_revision: i64,
    pub(crate) tables: HashMap<TableId, Arc<TableCell>>,
    pub(crate) mark_table_ids: HashSet<TableId>,
}

pub struct Processor {
    pub(crate) id: String,
    pub(crate) capture: CaptureInfo,
    pub(crate) changefeed_id: String,
    #[allow(dead_code)]
    pub(crate) changefeed: ChangefeedInfo,
    pub(crate) config: ChangefeedConfig,
    pub(crate) sort_engine: SortEngine,
    pub(crate) target_ts: Ts,
    pub(crate) stopped: AtomicBool,

    pub(crate) client: CoordClient,
    pub(crate) sink: Arc<dyn Sink>,
    pub(crate) schema: Arc<dyn SchemaStorage>,
    pub(crate) puller_factory: Arc<dyn PullerFactory>,
    pub(crate) limiter: Arc<MemoryLimiter>,
    pub(crate) mounter: Arc<Mounter>,
    pub(crate) ddl_puller: Arc<dyn Puller>,
    pub(crate) ddl_cancel: CancellationToken,

    pub(crate) sink_emitted_resolved_ts: AtomicU64,
    pub(crate) global_resolved_ts: AtomicU64,
    pub(crate) local_resolved_ts: AtomicU64,
    pub(crate) checkpoint_ts: AtomicU64,
    pub(crate) global_checkpoint_ts: AtomicU64,

    pub(crate) output_tx: MAsyncTx<Arc<Event>>,
    output_rx: Mutex<Option<AsyncRx<Arc<Event>>>>,

    pub(crate) state: Mutex<ProcessorState>,

    pub(crate) sink_emitted_notifier: Notifier,
    pub(crate) local_resolved_notifier: Notifier,
    pub(crate) local_checkpoint_notifier: Notifier,
    sink_emitted_rx: Mutex<Option<NotifyReceiver>>,
    local_resolved_rx: Mutex<Option<NotifyReceiver>>,
    local_checkpoint_rx: Mutex<Option<NotifyReceiver>>,

    pub(crate) op_done_tx: mpsc::Sender<TableId>,
    pub(crate) op_done_rx: Mutex<mpsc::Receiver<TableId>>,

    err_tx: mpsc::Sender<ProcessorError>,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: ProcessorMetrics,
}

impl Processor {
    /// Build a processor, fetch its task status and install the tables it
    /// already owns. Returns the processor plus the capacity-1 error channel
    /// carrying the first fatal error.
    pub async fn new(
        params: ProcessorParams,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ProcessorError>), ProcessorError> {
        params.config.validate()?;
        let sort_engine = params.config.sort_engine()?;

        tracing::info!(
            changefeed = %params.changefeed_id,
            start_ts = params.checkpoint_ts,
            "creating processor"
        );

        let limiter = Arc::new(MemoryLimiter::new(params.config.mem_buffer_bytes));
        let mounter = Arc::new(Mounter::new(
            Arc::clone(&params.schema),
            params.config.mounter_worker_num,
            params.config.enable_old_value,
            params.config.mounter_input_size,
        ));
        let ddl_puller = params.puller_factory.create(
            vec![ddl_span()],
            params.checkpoint_ts,
            Arc::clone(&limiter),
            false,
        );

        let (output_tx, output_rx) =
            crossfire::mpsc::bounded_async(params.config.output_channel_size);
        let (op_done_tx, op_done_rx) = mpsc::channel(256);
        let (err_tx, err_rx) = mpsc::channel(1);

        let sink_emitted_notifier = Notifier::new();
        let local_resolved_notifier = Notifier::new();
        let local_checkpoint_notifier = Notifier::new();
        let sink_emitted_rx = sink_emitted_notifier.receiver(WATERMARK_RECEIVER_INTERVAL);
        let local_resolved_rx = local_resolved_notifier.receiver(WATERMARK_RECEIVER_INTERVAL);
        let local_checkpoint_rx =
            local_checkpoint_notifier.receiver(WATERMARK_RECEIVER_INTERVAL);

        let cancel = CancellationToken::new();
        let ddl_cancel = cancel.child_token();
        let seq = PROCESSOR_SEQ.fetch_add(1, Ordering::Relaxed);

        let processor = Arc::new(Self {
            id: format!("{}-{}", params.capture.id, seq),
            capture: params.capture,
            changefeed_id: params.changefeed_id,
            target_ts: params.changefeed.effective_target_ts(),
            changefeed: params.changefeed,
            sort_engine,
            stopped: AtomicBool::new(false),
            client: CoordClient::new(params.store),
            sink: params.sink,
            schema: params.schema,
            puller_factory: params.puller_factory,
            limiter,
            mounter,
            ddl_puller,
            ddl_cancel,
            sink_emitted_resolved_ts: AtomicU64::new(0),
            global_resolved_ts: AtomicU64::new(0),
            local_resolved_ts: AtomicU64::new(0),
            checkpoint_ts: AtomicU64::new(params.checkpoint_ts),
            global_checkpoint_ts: AtomicU64::new(0),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            state: Mutex::new(ProcessorState {
                status: TaskStatus::default(),
                position: TaskPosition::new(params.checkpoint_ts),
                status_mod_revision: 0,
                tables: HashMap::new(),
                mark_table_ids: HashSet::new(),
            }),
            sink_emitted_notifier,
            local_resolved_notifier,
            local_checkpoint_notifier,
            sink_emitted_rx: Mutex::new(Some(sink_emitted_rx)),
            local_resolved_rx: Mutex::new(Some(local_resolved_rx)),
            local_checkpoint_rx: Mutex::new(Some(local_checkpoint_rx)),
            op_done_tx,
            op_done_rx: Mutex::new(op_done_rx),
            err_tx,
            cancel,
            metrics: ProcessorMetrics::default(),
            config: params.config,
        });

        // Pick up the tables this capture already owns.
        let (revision, status) = processor
            .client
            .get_task_status(&processor.changefeed_id, &processor.capture.id)
            .await?;
        {
            let mut state = processor.state.lock().unwrap();
            state.status_mod_revision = revision;
            state.status = status.clone();
            for (table_id, replica) in &status.tables {
                processor.add_table_locked(&mut state, *table_id, *replica);
            }
        }

        Ok((processor, err_rx))
    }

    /// Spawn every worker and the supervisor collecting their exits.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let mut tasks: JoinSet<Result<(), ProcessorError>> = JoinSet::new();

        macro_rules! worker {
            ($method:ident) => {{
                let this = Arc::clone(self);
                let token = cancel.clone();
                tasks.spawn(async move { this.$method(token).await });
            }};
        }

        worker!(position_worker);
        worker!(global_status_worker);
        worker!(sink_driver);
        worker!(sync_resolved);
        worker!(collect_metrics);
        worker!(ddl_pull_worker);
        worker!(workload_worker);

        {
            let puller = Arc::clone(&self.ddl_puller);
            let token = self.ddl_cancel.clone();
            tasks.spawn(async move { puller.run(token).await.map_err(ProcessorError::from) });
        }
        {
            let mounter = Arc::clone(&self.mounter);
            let token = cancel.clone();
            tasks.spawn(async move { mounter.run(token).await.map_err(ProcessorError::from) });
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(res) = tasks.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => this.report_err(e),
                    Err(join) if join.is_panic() => {
                        this.report_err(ProcessorError::Other(format!("worker panicked: {join}")));
                    }
                    Err(_) => {}
                }
            }
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    /// Deliver a fatal error: first cause wins the capacity-1 channel, and
    /// the whole scope is cancelled. Cancellation itself is silent.
    pub(crate) fn report_err(&self, err: ProcessorError) {
        if err.is_cancelled() {
            return;
        }
        let _ = self.err_tx.try_send(err);
        self.cancel.cancel();
    }

    /// Human-readable dump of the processor's live state.
    pub fn write_debug_info(&self, out: &mut String) {
        use std::fmt::Write;

        let state = self.state.lock().unwrap();
        let _ = writeln!(
            out,
            "changefeed: {}, status: {:?}, position: {:?}",
            self.changefeed_id, state.status, state.position
        );
        for cell in state.tables.values() {
            let _ = writeln!(
                out,
                "\ttable id: {}, name: {}, resolved_ts: {}",
                cell.id,
                cell.name,
                cell.effective_resolved_ts()
            );
        }
    }

    // ------------------------------------------------------------------
    // Watermark fan-in and task persistence
    // ------------------------------------------------------------------

    /// Recompute the local watermark on table ticks, persist
    /// the position on advancement, and apply the checkpoint flush throttle
    /// (which never throttles resolved-ts advancement).
    async fn position_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        let mut resolved_rx = self
            .local_resolved_rx
            .lock()
            .unwrap()
            .take()
            .expect("position worker started twice");
        let mut checkpoint_rx = self
            .local_checkpoint_rx
            .lock()
            .unwrap()
            .take()
            .expect("position worker started twice");
        let mut last_checkpoint_flush = Instant::now();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(ProcessorError::Cancelled),
                tick = resolved_rx.tick() => {
                    if tick.is_none() {
                        break Ok(());
                    }
                    let mut min_resolved = self.ddl_puller.resolved_ts();
                    {
                        let state = self.state.lock().unwrap();
                        for cell in state.tables.values() {
                            // Dying tables no longer hold the watermark
                            // back; their data stays safe behind the global
                            // fan-in gate.
                            if cell.is_dying() {
                                continue;
                            }
                            min_resolved = min_resolved.min(cell.effective_resolved_ts());
                        }
                    }
                    self.local_resolved_ts.store(min_resolved, Ordering::Release);
                    self.metrics.resolved_ts.store(min_resolved, Ordering::Relaxed);

                    let should_flush = {
                        let mut state = self.state.lock().unwrap();
                        if state.position.resolved_ts < min_resolved {
                            state.position.resolved_ts = min_resolved;
                            true
                        } else {
                            // Unapplied operations still need write passes
                            // even while the watermark holds still.
                            state.status.some_operations_unapplied()
                        }
                    };
                    if should_flush {
                        if let Err(e) = self.retry_flush_status_and_position().await {
                            break Err(e);
                        }
                    }
                }
                tick = checkpoint_rx.tick() => {
                    if tick.is_none() {
                        break Ok(());
                    }
                    let checkpoint = self.checkpoint_ts.load(Ordering::Acquire);
                    if checkpoint == 0 {
                        tracing::warn!(changefeed = %self.changefeed_id, "0 is not a valid checkpoint");
                        continue;
                    }
                    if last_checkpoint_flush.elapsed() < self.config.flush_checkpoint_interval() {
                        continue;
                    }
                    {
                        self.state.lock().unwrap().position.checkpoint_ts = checkpoint;
                    }
                    self.metrics.checkpoint_ts.store(checkpoint, Ordering::Relaxed);
                    if let Err(e) = self.retry_flush_status_and_position().await {
                        break Err(e);
                    }
                    last_checkpoint_flush = Instant::now();
                }
            }
        };

        // One last flush so the owner sees the final position.
        if !self.is_stopped() {
            if let Err(e) = self.retry_flush_status_and_position().await {
                if !e.is_cancelled() && !matches!(e, ProcessorError::AdminStop) {
                    tracing::warn!(
                        changefeed = %self.changefeed_id,
                        error = %e,
                        "failed to flush task state before exit"
                    );
                }
            }
        }
        tracing::info!(changefeed = %self.changefeed_id, "position worker exited");
        result
    }

    pub(crate) async fn retry_flush_status_and_position(
        self: &Arc<Self>,
    ) -> Result<(), ProcessorError> {
        let this = Arc::clone(self);
        retry::run(STATUS_RETRY_BASE, STATUS_RETRY_ATTEMPTS, move || {
            let this = Arc::clone(&this);
            async move {
                match this.flush_task_status_and_position().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if !e.is_cancelled() {
                            if matches!(e, ProcessorError::AdminStop) {
                                tracing::warn!(
                                    changefeed = %this.changefeed_id,
                                    "task is in a stop state"
                                );
                            } else {
                                tracing::error!(
                                    changefeed = %this.changefeed_id,
                                    error = %e,
                                    "failed to flush task status and position"
                                );
                            }
                        }
                        if this.is_stopped() || matches!(e, ProcessorError::AdminStop) {
                            return Err(RetryError::Permanent(ProcessorError::AdminStop));
                        }
                        // Scheduling errors cannot heal by retrying.
                        if matches!(
                            e,
                            ProcessorError::TableNotFound(_) | ProcessorError::MarkTableNotFound(_)
                        ) {
                            return Err(RetryError::Permanent(e));
                        }
                        Err(RetryError::Transient(e))
                    }
                }
            }
        })
        .await
    }

    /// One status-writer pass: fetch, schedule, CAS-write when dirty,
    /// persist the position.
    pub(crate) async fn flush_task_status_and_position(
        self: &Arc<Self>,
    ) -> Result<(), ProcessorError> {
        if self.is_stopped() {
            return Err(ProcessorError::AdminStop);
        }

        let (mod_revision, mut status) = self
            .client
            .get_task_status(&self.changefeed_id, &self.capture.id)
            .await?;

        let unchanged = {
            let state = self.state.lock().unwrap();
            mod_revision == state.status_mod_revision && !status.some_operations_unapplied()
        };
        if unchanged {
            return self.flush_task_position().await;
        }
        if status.admin_job_type.is_stop_state() {
            return Err(ProcessorError::AdminStop);
        }

        let outcome = {
            let mut state = self.state.lock().unwrap();
            self.handle_tables_locked(&mut state, &mut status)?
        };

        if status.dirty {
            self.flush_task_position().await?;
            match self
                .client
                .put_task_status(&self.changefeed_id, &self.capture.id, &status, mod_revision)
                .await
            {
                Ok(new_revision) => {
                    let mut state = self.state.lock().unwrap();
                    state.status_mod_revision = new_revision;
                    status.dirty = false;
                    state.status = status;
                    self.metrics.status_flushes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // The pass is retried from scratch; hand the consumed
                    // done signals back so the retry sees them again.
                    for table_id in outcome.op_done_acks {
                        let _ = self.op_done_tx.try_send(table_id);
                    }
                    let _ = self.flush_task_position().await;
                    return Err(e.into());
                }
            }
        }

        for table_id in outcome.to_remove {
            self.remove_table(table_id);
        }
        self.flush_task_position().await
    }

    pub(crate) async fn flush_task_position(&self) -> Result<(), ProcessorError> {
        if self.is_stopped() {
            return Err(ProcessorError::AdminStop);
        }
        let position = self.state.lock().unwrap().position.clone();
        let updated = self
            .client
            .put_task_position_on_change(&self.changefeed_id, &self.capture.id, &position)
            .await?;
        if updated {
            tracing::debug!(
                changefeed = %self.changefeed_id,
                checkpoint_ts = position.checkpoint_ts,
                resolved_ts = position.resolved_ts,
                "flushed task position"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Global watermark
    // ------------------------------------------------------------------

    fn update_global_status(
        &self,
        status: ChangeFeedStatus,
        last_resolved: &mut Ts,
        last_checkpoint: &mut Ts,
        fanout: &Notifier,
    ) {
        self.global_checkpoint_ts
            .store(status.checkpoint_ts, Ordering::Release);
        if *last_resolved == status.resolved_ts && *last_checkpoint == status.checkpoint_ts {
            return;
        }
        if *last_checkpoint < status.checkpoint_ts {
            // GC trails the checkpoint so pullers starting from an old
            // timestamp can still mount against old schema versions.
            let gc_ms = ts::physical_ms(status.checkpoint_ts).saturating_sub(SCHEMA_GC_LAG_MS);
            self.schema.do_gc(ts::compose(gc_ms, 0));
            *last_checkpoint = status.checkpoint_ts;
        }
        if *last_resolved < status.resolved_ts {
            *last_resolved = status.resolved_ts;
            self.global_resolved_ts
                .store(*last_resolved, Ordering::Release);
            tracing::debug!(
                changefeed = %self.changefeed_id,
                global_resolved_ts = *last_resolved,
                "global resolved ts advanced"
            );
            fanout.notify();
        }
    }

    /// Read the owner-published changefeed status (with retry),
    /// watch it for updates (re-reading on compaction), and fan the global
    /// watermark into the output queue at a 1 s pace, gated by
    /// `global <= local`.
    async fn global_status_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        tracing::info!(changefeed = %self.changefeed_id, "global status worker started");
        let mut last_resolved: Ts = 0;
        let mut last_checkpoint: Ts = 0;
        let fanout_notifier = Arc::new(Notifier::new());
        let mut fanout_rx = fanout_notifier.receiver(GLOBAL_FANOUT_INTERVAL);

        let fanout_task = tokio::spawn({
            let this = Arc::clone(&self);
            let notifier = Arc::clone(&fanout_notifier);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        tick = fanout_rx.tick() => {
                            if tick.is_none() {
                                return;
                            }
                        }
                    }
                    let global = this.global_resolved_ts.load(Ordering::Acquire);
                    let local = this.local_resolved_ts.load(Ordering::Acquire);
                    if global > local {
                        tracing::warn!(
                            changefeed = %this.changefeed_id,
                            global_resolved_ts = global,
                            local_resolved_ts = local,
                            "global resolved ts ahead of local, holding back"
                        );
                        // Re-arm so the watermark is emitted once the local
                        // side catches up, at the same 1 s pace.
                        notifier.notify();
                        continue;
                    }
                    // Region 0 marks processor-produced watermarks.
                    let event = Arc::new(Event::resolved(0, global));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = this.output_tx.send(event) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        let result = 'outer: loop {
            let read = {
                let this = Arc::clone(&self);
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer Err(ProcessorError::Cancelled),
                    res = retry::run(STATUS_RETRY_BASE, CHANGEFEED_READ_ATTEMPTS, move || {
                        let this = Arc::clone(&this);
                        async move {
                            this.client
                                .get_changefeed_status(&this.changefeed_id)
                                .await
                                .map_err(|e| {
                                    tracing::error!(
                                        changefeed = %this.changefeed_id,
                                        error = %e,
                                        "failed to read changefeed status"
                                    );
                                    RetryError::Transient(e)
                                })
                        }
                    }) => res,
                }
            };
            let (status, revision) = match read {
                Ok(v) => v,
                Err(e) => break Err(e.into()),
            };
            self.update_global_status(
                status,
                &mut last_resolved,
                &mut last_checkpoint,
                &fanout_notifier,
            );

            let mut watch = match self
                .client
                .watch_changefeed_status(&self.changefeed_id, revision + 1)
                .await
            {
                Ok(rx) => rx,
                Err(e) => break Err(e.into()),
            };
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break 'outer Err(ProcessorError::Cancelled),
                    ev = watch.recv() => ev,
                };
                match event {
                    // Watch torn down by the store; start over.
                    None => break,
                    Some(WatchEvent::Compacted) => {
                        tracing::info!(
                            changefeed = %self.changefeed_id,
                            "changefeed status watch compacted, re-reading"
                        );
                        break;
                    }
                    // Deletion of the job key is the owner's business.
                    Some(WatchEvent::Delete) => continue,
                    Some(WatchEvent::Put(kv)) => {
                        let status: ChangeFeedStatus = match serde_json::from_slice(&kv.value) {
                            Ok(s) => s,
                            Err(e) => break 'outer Err(StoreError::from(e).into()),
                        };
                        self.update_global_status(
                            status,
                            &mut last_resolved,
                            &mut last_checkpoint,
                            &fanout_notifier,
                        );
                    }
                }
            }
        };

        fanout_task.abort();
        tracing::info!(changefeed = %self.changefeed_id, "global status worker exited");
        result
    }

    // ------------------------------------------------------------------
    // Sink side
    // ------------------------------------------------------------------

    /// On each sink-emitted tick, flush `min(sinkEmitted, global)` and
    /// advance the checkpoint to whatever the sink made durable.
    async fn sink_driver(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ProcessorError> {
        let mut rx = self
            .sink_emitted_rx
            .lock()
            .unwrap()
            .take()
            .expect("sink driver started twice");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                tick = rx.tick() => {
                    if tick.is_none() {
                        return Ok(());
                    }
                }
            }

            let sink_emitted = self.sink_emitted_resolved_ts.load(Ordering::Acquire);
            let global = self.global_resolved_ts.load(Ordering::Acquire);
            let min_ts = sink_emitted.min(global);
            if min_ts == 0 || min_ts == self.checkpoint_ts.load(Ordering::Acquire) {
                continue;
            }

            let start = Instant::now();
            let durable = self.sink.flush(min_ts).await?;
            if durable != 0 {
                self.checkpoint_ts.store(durable, Ordering::Release);
                self.local_checkpoint_notifier.notify();
            }

            let elapsed = start.elapsed();
            let slow = elapsed > SLOW_FLUSH_THRESHOLD;
            self.metrics.record_flush(elapsed.as_micros() as u64, slow);
            if slow {
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "sink flush too slow"
                );
            }
        }
    }

    /// The serialization point: batch rows per watermark window, await
    /// each row's mounter latch in emission order, and publish the
    /// sink-emitted watermark.
    async fn sync_resolved(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ProcessorError> {
        let output_rx = self
            .output_rx
            .lock()
            .unwrap()
            .take()
            .expect("sync resolved started twice");
        let mut pending: Vec<Arc<Event>> = Vec::with_capacity(SYNC_RESOLVED_BATCH);
        let mut resolved_ts: Ts = 0;

        let result = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break Err(ProcessorError::Cancelled),
                ev = output_rx.recv() => match ev {
                    Ok(ev) => ev,
                    Err(_) => break Ok(()),
                },
            };

            if event.is_resolved() {
                if let Err(e) = self.emit_pending(&mut pending, &cancel).await {
                    break Err(e);
                }
                resolved_ts = event.commit_ts;
                self.sink_emitted_resolved_ts
                    .store(event.commit_ts, Ordering::Release);
                self.metrics
                    .sink_emitted_resolved_ts
                    .store(event.commit_ts, Ordering::Relaxed);
                self.sink_emitted_notifier.notify();
                continue;
            }

            // Clamp first: a freshly added table legitimately lowers the
            // local watermark below what was already forwarded. Assert
            // second, against the clamped value.
            let local_resolved = self.local_resolved_ts.load(Ordering::Acquire);
            if resolved_ts > local_resolved {
                tracing::info!(
                    changefeed = %self.changefeed_id,
                    local_resolved_ts = local_resolved,
                    resolved_ts,
                    "local resolved ts fell back, clamping"
                );
                self.metrics.resolved_fallbacks.fetch_add(1, Ordering::Relaxed);
                resolved_ts = local_resolved;
            }
            if event.commit_ts <= resolved_ts {
                panic!(
                    "row commit_ts {} not above resolved ts {} (changefeed {})",
                    event.commit_ts, resolved_ts, self.changefeed_id
                );
            }

            pending.push(event);
            if pending.len() >= SYNC_RESOLVED_BATCH {
                if let Err(e) = self.emit_pending(&mut pending, &cancel).await {
                    break Err(e);
                }
            }
        };

        tracing::info!(changefeed = %self.changefeed_id, "sync resolved exited");
        result
    }

    /// Await each pending event's latch in order, drop rows the mounter
    /// skipped, and hand the batch to the sink.
    async fn emit_pending(
        &self,
        pending: &mut Vec<Arc<Event>>,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessorError> {
        let mut rows: Vec<RowChange> = Vec::with_capacity(pending.len());
        for event in pending.drain(..) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                _ = event.wait_prepared() => {}
            }
            if let Some(row) = event.row() {
                rows.push(row.clone());
            }
        }
        self.sink.emit_rows(&rows).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // DDL, workload, metrics
    // ------------------------------------------------------------------

    /// C10: order the DDL stream, advance the schema watermark on resolved
    /// entries, apply jobs in commit order.
    async fn ddl_pull_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        let raw_rx = self.ddl_puller.take_output();
        let mut sorted = sort_raw_output(raw_rx, cancel.clone());

        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                entry = sorted.recv() => match entry {
                    Some(entry) => entry,
                    None => return Ok(()),
                },
            };
            self.limiter.release(entry.size());

            if entry.is_resolved() {
                self.schema.advance_resolved_ts(entry.commit_ts);
                self.local_resolved_notifier.notify();
                continue;
            }
            let job = match decode_ddl_job(&entry.value) {
                Ok(job) => job,
                Err(e) => {
                    return Err(ProcessorError::Other(format!(
                        "failed to decode ddl job: {e}"
                    )))
                }
            };
            tracing::info!(
                changefeed = %self.changefeed_id,
                job_id = job.id,
                finished_ts = job.finished_ts,
                query = %job.query,
                "applying ddl job"
            );
            self.schema.handle_ddl_job(&job)?;
        }
    }

    /// Report per-table workload every 10 s (and once, empty, at startup).
    async fn workload_worker(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        self.client
            .put_task_workload(&self.changefeed_id, &self.capture.id, &TaskWorkload::new())
            .await?;

        let mut ticker = tokio::time::interval(WORKLOAD_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                _ = ticker.tick() => {}
            }
            if self.is_stopped() {
                continue;
            }
            let workload: TaskWorkload = {
                let state = self.state.lock().unwrap();
                state
                    .tables
                    .values()
                    .map(|cell| (cell.id, cell.workload()))
                    .collect()
            };
            self.client
                .put_task_workload(&self.changefeed_id, &self.capture.id, &workload)
                .await?;
        }
    }

    async fn collect_metrics(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessorError::Cancelled),
                _ = ticker.tick() => {}
            }
            let table_count = self.state.lock().unwrap().tables.len() as u64;
            self.metrics.table_count.store(table_count, Ordering::Relaxed);
            self.metrics.resolved_ts.store(
                self.local_resolved_ts.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
            self.metrics.checkpoint_ts.store(
                self.checkpoint_ts.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Graceful stop: tear down pipelines, delete this capture's task keys,
    /// close the sink last.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        tracing::info!(
            processor = %self.id,
            capture = %self.capture.advertise_addr,
            changefeed = %self.changefeed_id,
            "stopping processor"
        );
        self.cancel_all_tables();
        self.ddl_cancel.cancel();
        self.stopped.store(true, Ordering::Release);

        self.client
            .delete_task_keys(&self.changefeed_id, &self.capture.id)
            .await?;
        self.sink.close().await?;
        Ok(())
    }
}

/// A running processor: the handle owns the supervisor and surfaces the
/// first fatal error.
pub struct ProcessorHandle {
    pub processor: Arc<Processor>,
    supervisor: JoinHandle<()>,
    done: watch::Receiver<Option<Arc<ProcessorError>>>,
}

impl ProcessorHandle {
    /// Wait until the processor dies; yields its first fatal error.
    pub async fn wait(&mut self) -> Arc<ProcessorError> {
        match self.done.wait_for(|e| e.is_some()).await {
            Ok(guard) => Arc::clone(guard.as_ref().unwrap()),
            Err(_) => Arc::new(ProcessorError::Cancelled),
        }
    }

    /// First fatal error observed so far, if any.
    pub fn error(&self) -> Option<Arc<ProcessorError>> {
        self.done.borrow().clone()
    }

    /// Graceful stop followed by full teardown.
    pub async fn shutdown(self) -> Result<(), ProcessorError> {
        let result = self.processor.stop().await;
        self.processor.cancel.cancel();
        let _ = self.supervisor.await;
        result
    }
}

/// Create and start a processor. Fatal errors are recorded in the persisted
/// task position (code, message, address) before the scope is cancelled.
pub async fn run_processor(params: ProcessorParams) -> Result<ProcessorHandle, ProcessorError> {
    let (processor, mut err_rx) = Processor::new(params).await?;
    tracing::info!(
        changefeed = %processor.changefeed_id,
        processor = %processor.id,
        "starting processor"
    );
    let supervisor = processor.start();

    let (done_tx, done_rx) = watch::channel(None);
    {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            // Errors are enqueued before the scope is cancelled, so polling
            // the channel first never misses the first cause.
            let received = tokio::select! {
                biased;
                err = err_rx.recv() => err,
                _ = processor.cancel.cancelled() => None,
            };
            let err = match received.or_else(|| err_rx.try_recv().ok()) {
                Some(err) => err,
                None => ProcessorError::Cancelled,
            };
            if !err.is_cancelled() && !matches!(err, ProcessorError::AdminStop) {
                tracing::error!(
                    changefeed = %processor.changefeed_id,
                    processor = %processor.id,
                    error = %err,
                    "processor failed"
                );
                let running_error = RunningError {
                    addr: processor.capture.advertise_addr.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                };
                let position = {
                    let mut state = processor.state.lock().unwrap();
                    state.position.error = Some(running_error);
                    state.position.clone()
                };
                if let Err(e) = processor
                    .client
                    .put_task_position_on_change(
                        &processor.changefeed_id,
                        &processor.capture.id,
                        &position,
                    )
                    .await
                {
                    tracing::warn!(
                        changefeed = %processor.changefeed_id,
                        error = %e,
                        "failed to upload processor error"
                    );
                }
            } else {
                tracing::info!(
                    changefeed = %processor.changefeed_id,
                    processor = %processor.id,
                    "processor exited"
                );
            }
            processor.cancel.cancel();
            let _ = done_tx.send(Some(Arc::new(err)));
        });
    }

    Ok(ProcessorHandle {
        processor,
        supervisor,
        done: done_rx,
    })
}
