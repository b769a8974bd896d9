//! End-to-end processor scenarios.
//!
//! Each test runs a real processor against the in-memory coordination
//! store, plays the owner (task status writes, global watermark publishes)
//! and the upstream store (puller feeds), and asserts on the exact call
//! sequence observed by the capture sink plus the state persisted back to
//! the store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use drift_coord::{CoordClient, CoordStore, KeyValue, MemStore, StoreError, WatchEvent};
use drift_model::{
    encode_row_key, CaptureInfo, ChangeFeedStatus, ChangefeedInfo, OpType, RawEntry, ReplicaInfo,
    TableId, TableOperation, TaskStatus, Ts,
};
use drift_pipeline::{
    ChannelPullerFactory, MemorySchemaStorage, PullerFactory, PullerFeed, SchemaSnapshot,
    SchemaStorage, TableSchema,
};
use drift_processor::{
    run_processor, ChangefeedConfig, ProcessorError, ProcessorHandle, ProcessorParams,
};
use drift_sinks::{CaptureSink, Sink, SinkCall};

const CF: &str = "cf-test";
const CAPTURE: &str = "capture-1";

/// The DDL pump starts well above any table timestamp the tests use, like
/// the meta-range watermark tracking the upstream clock in production.
const DDL_PUMP_BASE: Ts = 1_000_000;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    client: CoordClient,
    sink: Arc<CaptureSink>,
    factory: Arc<ChannelPullerFactory>,
    handle: ProcessorHandle,
    ddl_pump: tokio::task::JoinHandle<()>,
}

fn table_schema(id: TableId) -> TableSchema {
    TableSchema {
        id,
        schema_name: "db".into(),
        table_name: format!("t{id}"),
        columns: vec!["id".into(), "name".into()],
    }
}

fn put_entry(table_id: TableId, handle: i64, commit_ts: Ts) -> RawEntry {
    let value = json!({"id": handle, "name": format!("row-{handle}")});
    RawEntry {
        op: OpType::Put,
        key: encode_row_key(table_id, handle),
        value: serde_json::to_vec(&value).unwrap().into(),
        old_value: None,
        start_ts: commit_ts - 1,
        commit_ts,
        region_id: 1,
    }
}

async fn start_harness(config: ChangefeedConfig) -> Harness {
    let mem = Arc::new(MemStore::new());
    start_harness_on(mem, config).await
}

async fn start_harness_on(store: Arc<dyn CoordStore>, config: ChangefeedConfig) -> Harness {
    let client = CoordClient::new(Arc::clone(&store));
    // The owner publishes the job before any capture joins.
    client
        .put_changefeed_status(CF, &ChangeFeedStatus::default())
        .await
        .unwrap();

    let sink = Arc::new(CaptureSink::new());
    let factory = Arc::new(ChannelPullerFactory::new());
    let schema = Arc::new(MemorySchemaStorage::new(SchemaSnapshot::with_tables(
        0,
        vec![table_schema(99), table_schema(100), table_schema(101)],
    )));

    let handle = run_processor(ProcessorParams {
        store,
        sink: Arc::clone(&sink) as Arc<dyn Sink>,
        schema: schema as Arc<dyn SchemaStorage>,
        puller_factory: Arc::clone(&factory) as Arc<dyn PullerFactory>,
        changefeed_id: CF.into(),
        capture: CaptureInfo {
            id: CAPTURE.into(),
            advertise_addr: "127.0.0.1:8300".into(),
        },
        changefeed: ChangefeedInfo::default(),
        config,
        checkpoint_ts: 0,
    })
    .await
    .expect("processor should start");

    // Continuous meta-range watermarks keep the schema storage and the
    // status writer ticking, as the upstream does in production.
    let ddl_feed = factory.ddl_feed().expect("ddl puller registered");
    let ddl_pump = tokio::spawn(async move {
        let mut ts = DDL_PUMP_BASE;
        loop {
            if !ddl_feed.send_resolved(0, ts).await {
                return;
            }
            ts += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    Harness {
        client,
        sink,
        factory,
        handle,
        ddl_pump,
    }
}

impl Harness {
    /// Owner-side read-modify-write of the task status, retried on CAS
    /// races with the processor.
    async fn owner_update(&self, update: impl Fn(&mut TaskStatus)) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let (rev, mut status) = self.client.get_task_status(CF, CAPTURE).await.unwrap();
            update(&mut status);
            match self.client.put_task_status(CF, CAPTURE, &status, rev).await {
                Ok(_) => return,
                Err(StoreError::Conflict { .. }) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("owner status write failed: {e}"),
            }
        }
    }

    async fn owner_add_table(&self, table_id: TableId, start_ts: Ts) {
        self.owner_update(|status| {
            status.tables.insert(
                table_id,
                ReplicaInfo {
                    start_ts,
                    mark_table_id: 0,
                },
            );
            status.operation.insert(table_id, TableOperation::default());
        })
        .await;
    }

    async fn owner_delete_table(&self, table_id: TableId, boundary_ts: Ts) {
        self.owner_update(|status| {
            status.tables.remove(&table_id);
            status.operation.insert(
                table_id,
                TableOperation {
                    delete: true,
                    boundary_ts,
                    ..Default::default()
                },
            );
        })
        .await;
    }

    async fn publish_global(&self, resolved_ts: Ts, checkpoint_ts: Ts) {
        self.client
            .put_changefeed_status(
                CF,
                &ChangeFeedStatus {
                    resolved_ts,
                    checkpoint_ts,
                },
            )
            .await
            .unwrap();
    }

    /// The live feed for a table, waiting out the asynchronous install.
    async fn feed(&self, table_id: TableId) -> PullerFeed {
        let factory = Arc::clone(&self.factory);
        wait_until(&format!("puller for table {table_id}"), move || {
            factory.feed(table_id)
        })
        .await
    }

    async fn shutdown(self) {
        self.ddl_pump.abort();
        self.handle.shutdown().await.expect("clean shutdown");
    }
}

/// Repeat one watermark on a feed until its puller goes away. Doubles as a
/// liveness probe: the returned task completes exactly when the pipeline is
/// torn down.
fn pump_resolved(feed: PullerFeed, ts: Ts) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !feed.send_resolved(1, ts).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

/// Poll a synchronous probe until it yields, failing the test at the
/// deadline.
async fn wait_until<T>(what: &str, mut probe: impl FnMut() -> Option<T>) -> T {
    let result = timeout(WAIT, async {
        loop {
            if let Some(v) = probe() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    match result {
        Ok(v) => v,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Poll an async probe (capture owned handles in the closure).
async fn wait_until_async<T, Fut, F>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let result = timeout(WAIT, async {
        loop {
            if let Some(v) = probe().await {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    match result {
        Ok(v) => v,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

async fn wait_for_empty_operations(client: &CoordClient) {
    let client = client.clone();
    wait_until_async("operations to finish", move || {
        let client = client.clone();
        async move {
            let (_, status) = client.get_task_status(CF, CAPTURE).await.unwrap();
            status.operation.is_empty().then_some(())
        }
    })
    .await;
}

// ===========================================================================
// Steady state and watermark laws
// ===========================================================================

#[tokio::test]
async fn test_single_table_add_steady_state() {
    let h = start_harness(ChangefeedConfig::default()).await;

    h.owner_add_table(99, 100).await;
    let feed = h.feed(99).await;

    feed.send(put_entry(99, 1, 150)).await;
    feed.send_resolved(1, 200).await;
    h.publish_global(200, 0).await;

    // The decoded row lands, then the checkpoint follows the watermark.
    let sink = Arc::clone(&h.sink);
    wait_until("row at 150 in sink", move || {
        sink.emitted_rows().iter().any(|r| r.commit_ts == 150).then_some(())
    })
    .await;
    let sink = Arc::clone(&h.sink);
    wait_until("flush at 200", move || {
        sink.flushed_ts().contains(&200).then_some(())
    })
    .await;

    let rows = h.sink.emitted_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].table_id, 99);
    assert_eq!(rows[0].table, "t99");
    assert_eq!(rows[0].columns[0].value, json!(1));
    assert_eq!(rows[0].columns[1].value, json!("row-1"));

    // Position persisted at the watermark, operation finished (cleared).
    let client = h.client.clone();
    wait_until_async("position at 200/200", move || {
        let client = client.clone();
        async move {
            let pos = client.get_task_position(CF, CAPTURE).await.unwrap()?;
            (pos.checkpoint_ts == 200 && pos.resolved_ts == 200).then_some(())
        }
    })
    .await;
    wait_for_empty_operations(&h.client).await;

    // Flush targets never regress.
    let flushed = h.sink.flushed_ts();
    assert!(flushed.windows(2).all(|w| w[0] <= w[1]));

    h.shutdown().await;
}

#[tokio::test]
async fn test_rows_batch_between_watermarks() {
    // Row(10) Row(20) Resolved(25) Row(30) Resolved(40) produces exactly
    // EmitRows([10,20]); Flush(25); EmitRows([30]); Flush(40).
    let h = start_harness(ChangefeedConfig::default()).await;

    h.owner_add_table(99, 5).await;
    let feed = h.feed(99).await;

    feed.send(put_entry(99, 1, 10)).await;
    feed.send(put_entry(99, 2, 20)).await;
    feed.send_resolved(1, 25).await;
    h.publish_global(25, 0).await;

    let sink = Arc::clone(&h.sink);
    wait_until("first flush", move || {
        sink.flushed_ts().contains(&25).then_some(())
    })
    .await;

    feed.send(put_entry(99, 3, 30)).await;
    feed.send_resolved(1, 40).await;
    h.publish_global(40, 25).await;

    let sink = Arc::clone(&h.sink);
    wait_until("second flush", move || {
        sink.flushed_ts().contains(&40).then_some(())
    })
    .await;

    let calls = h.sink.calls();
    assert_eq!(calls.len(), 4, "unexpected call sequence: {calls:?}");
    match &calls[0] {
        SinkCall::EmitRows(rows) => {
            assert_eq!(
                rows.iter().map(|r| r.commit_ts).collect::<Vec<_>>(),
                [10, 20]
            );
        }
        other => panic!("expected emit, got {other:?}"),
    }
    assert_eq!(calls[1], SinkCall::Flush(25));
    match &calls[2] {
        SinkCall::EmitRows(rows) => {
            assert_eq!(rows.iter().map(|r| r.commit_ts).collect::<Vec<_>>(), [30]);
        }
        other => panic!("expected emit, got {other:?}"),
    }
    assert_eq!(calls[3], SinkCall::Flush(40));

    h.shutdown().await;
}

#[tokio::test]
async fn test_global_watermark_is_min_across_tables() {
    // T100 resolves to 50, T101 only to 40; the emitted global watermark
    // is 40, not 50.
    let h = start_harness(ChangefeedConfig::default()).await;

    h.owner_add_table(100, 5).await;
    h.owner_add_table(101, 5).await;
    let feed_a = h.feed(100).await;
    let feed_b = h.feed(101).await;

    feed_a.send_resolved(1, 50).await;
    feed_b.send_resolved(1, 40).await;
    h.publish_global(40, 0).await;

    let sink = Arc::clone(&h.sink);
    wait_until("flush at 40", move || {
        sink.flushed_ts().contains(&40).then_some(())
    })
    .await;
    assert_eq!(h.sink.flushed_ts(), vec![40]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_lagging_global_watermark_gates_flush() {
    // Local reaches 500 but the owner has only published 300: the sink is
    // flushed at min(500, 300) = 300.
    let h = start_harness(ChangefeedConfig::default()).await;

    h.owner_add_table(99, 100).await;
    let feed = h.feed(99).await;

    feed.send(put_entry(99, 7, 450)).await;
    feed.send_resolved(1, 500).await;
    h.publish_global(300, 0).await;

    let sink = Arc::clone(&h.sink);
    wait_until("flush at 300", move || {
        sink.flushed_ts().contains(&300).then_some(())
    })
    .await;
    assert!(h.sink.flushed_ts().iter().all(|ts| *ts <= 300));
    // The row itself was already handed over; durability just stops at 300.
    assert_eq!(h.sink.emitted_rows()[0].commit_ts, 450);

    h.shutdown().await;
}

// ===========================================================================
// Table lifecycle
// ===========================================================================

/// Bring table 99 to a steady checkpoint of 200.
async fn steady_state_at_200(h: &Harness) -> PullerFeed {
    h.owner_add_table(99, 100).await;
    let feed = h.feed(99).await;
    feed.send(put_entry(99, 1, 150)).await;
    feed.send_resolved(1, 200).await;
    h.publish_global(200, 0).await;
    let sink = Arc::clone(&h.sink);
    wait_until("steady checkpoint 200", move || {
        sink.flushed_ts().contains(&200).then_some(())
    })
    .await;
    wait_for_empty_operations(&h.client).await;
    feed
}

#[tokio::test]
async fn test_delete_at_boundary() {
    let h = start_harness(ChangefeedConfig::default()).await;
    let feed = steady_state_at_200(&h).await;

    // Boundary 180 is already checkpointed: safe-stop begins immediately;
    // the repeated watermark drains the rectifier to 210, and the rewritten
    // boundary completes once 210 is checkpointed.
    h.owner_delete_table(99, 180).await;
    let pump = pump_resolved(feed, 210);
    h.publish_global(210, 200).await;

    wait_for_empty_operations(&h.client).await;
    let client = h.client.clone();
    wait_until_async("table gone from status", move || {
        let client = client.clone();
        async move {
            let (_, status) = client.get_task_status(CF, CAPTURE).await.unwrap();
            (!status.tables.contains_key(&99)).then_some(())
        }
    })
    .await;

    // The pump ends exactly when the cancelled puller drops its feed.
    timeout(WAIT, pump)
        .await
        .expect("old pipeline feed should close")
        .unwrap();

    h.shutdown().await;
}

#[tokio::test]
async fn test_delete_deferred_past_boundary() {
    let h = start_harness(ChangefeedConfig::default()).await;
    let feed = steady_state_at_200(&h).await;

    // Boundary 300 is ahead of the checkpoint (200): nothing may happen.
    h.owner_delete_table(99, 300).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (_, status) = h.client.get_task_status(CF, CAPTURE).await.unwrap();
    assert!(
        status.operation.get(&99).is_some_and(|op| !op.applied()),
        "delete must stay pending while the boundary is unreached"
    );

    // Let the table and the checkpoint catch up with the boundary.
    let pump = pump_resolved(feed, 300);
    h.publish_global(300, 200).await;
    let sink = Arc::clone(&h.sink);
    wait_until("checkpoint at 300", move || {
        sink.flushed_ts().contains(&300).then_some(())
    })
    .await;

    wait_for_empty_operations(&h.client).await;
    let client = h.client.clone();
    wait_until_async("table removed", move || {
        let client = client.clone();
        async move {
            let (_, status) = client.get_task_status(CF, CAPTURE).await.unwrap();
            (!status.tables.contains_key(&99)).then_some(())
        }
    })
    .await;
    timeout(WAIT, pump)
        .await
        .expect("old pipeline feed should close")
        .unwrap();

    h.shutdown().await;
}

#[tokio::test]
async fn test_readd_while_dying_replaces_pipeline() {
    let h = start_harness(ChangefeedConfig::default()).await;
    let old_feed = steady_state_at_200(&h).await;

    // Start a delete; the single watermark lets the scheduler see it and
    // begin the safe stop, but the rectifier never gets the follow-up
    // watermark it needs to finish draining, so the table stays dying.
    h.owner_delete_table(99, 180).await;
    old_feed.send_resolved(1, 205).await;
    // A stranded row in the old sorter; it must never surface.
    old_feed.send(put_entry(99, 66, 206)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The owner re-adds the same table at a later timestamp: the dying
    // pipeline is cancelled and a fresh one installed.
    h.owner_add_table(99, 400).await;

    let factory = Arc::clone(&h.factory);
    let old_probe = old_feed.clone();
    let new_feed = wait_until("fresh puller for table 99", move || {
        let candidate = factory.feed(99)?;
        (!candidate.same_channel(&old_probe)).then_some(candidate)
    })
    .await;

    // The cancelled pipeline's feed goes dead.
    let old_pump = pump_resolved(old_feed, 205);
    timeout(WAIT, old_pump)
        .await
        .expect("old pipeline feed should close")
        .unwrap();

    new_feed.send(put_entry(99, 2, 450)).await;
    new_feed.send_resolved(1, 500).await;
    h.publish_global(500, 200).await;

    let sink = Arc::clone(&h.sink);
    wait_until("new pipeline's row at 450", move || {
        sink.emitted_rows().iter().any(|r| r.commit_ts == 450).then_some(())
    })
    .await;
    wait_for_empty_operations(&h.client).await;

    // Nothing from the cancelled pipeline ever reached the sink.
    assert!(
        h.sink.emitted_rows().iter().all(|r| r.commit_ts != 206),
        "stranded row from the old pipeline leaked into the sink"
    );

    h.shutdown().await;
}

// ===========================================================================
// Coordination
// ===========================================================================

/// Store wrapper that makes the processor's first task-status CAS lose its
/// race: a competing revision slips in between its read and its write.
/// Owner writes (guard 0, key creation) are left alone.
struct RacingStore {
    inner: Arc<MemStore>,
    raced: AtomicBool,
}

#[async_trait::async_trait]
impl CoordStore for RacingStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError> {
        self.inner.put(key, value).await
    }

    async fn cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> Result<i64, StoreError> {
        if key.starts_with("/task/status")
            && expected_mod_revision > 0
            && !self.raced.swap(true, Ordering::AcqRel)
        {
            if let Some(current) = self.inner.get(key).await? {
                self.inner.put(key, current.value).await?;
            }
        }
        self.inner.cas(key, value, expected_mod_revision).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
    ) -> Result<tokio::sync::mpsc::UnboundedReceiver<WatchEvent>, StoreError> {
        self.inner.watch(key, from_revision).await
    }
}

#[tokio::test]
async fn test_status_cas_conflict_is_retried_to_convergence() {
    let mem = Arc::new(MemStore::new());
    let racing = Arc::new(RacingStore {
        inner: Arc::clone(&mem),
        raced: AtomicBool::new(false),
    });
    let h = start_harness_on(racing, ChangefeedConfig::default()).await;

    h.owner_add_table(99, 100).await;
    let feed = h.feed(99).await;
    feed.send(put_entry(99, 1, 150)).await;
    feed.send_resolved(1, 200).await;
    h.publish_global(200, 0).await;

    // Despite the lost race the processor converges: the row is delivered
    // exactly once and the operation finishes exactly once.
    let sink = Arc::clone(&h.sink);
    wait_until("flush at 200", move || {
        sink.flushed_ts().contains(&200).then_some(())
    })
    .await;
    wait_for_empty_operations(&h.client).await;
    assert_eq!(
        h.sink
            .emitted_rows()
            .iter()
            .filter(|r| r.commit_ts == 150)
            .count(),
        1
    );

    h.shutdown().await;
}

#[tokio::test]
async fn test_admin_stop_is_permanent() {
    let mut h = start_harness(ChangefeedConfig::default()).await;
    h.owner_add_table(99, 100).await;
    let feed = h.feed(99).await;
    feed.send_resolved(1, 200).await;

    h.owner_update(|status| {
        status.admin_job_type = drift_model::AdminJobType::Stop;
    })
    .await;
    // Watermark ticks drive the writer into the admin state.
    let pump = pump_resolved(feed, 201);

    let err = timeout(WAIT, h.handle.wait())
        .await
        .expect("processor should stop on admin command");
    assert!(matches!(*err, ProcessorError::AdminStop));

    pump.abort();
    h.ddl_pump.abort();
}

#[tokio::test]
async fn test_fatal_error_is_recorded_in_position() {
    // Cyclic mode demands a mark table; an Add without one is fatal and the
    // position carries the error code for the owner.
    let config = ChangefeedConfig {
        cyclic_enabled: true,
        ..Default::default()
    };
    let mut h = start_harness(config).await;

    h.owner_add_table(99, 100).await;

    let err = timeout(WAIT, h.handle.wait())
        .await
        .expect("processor should fail on missing mark table");
    assert!(matches!(*err, ProcessorError::MarkTableNotFound(99)));

    let client = h.client.clone();
    wait_until_async("error recorded in position", move || {
        let client = client.clone();
        async move {
            let pos = client.get_task_position(CF, CAPTURE).await.unwrap()?;
            let error = pos.error?;
            assert_eq!(error.code, "CDC:ErrProcessorTableNotFound");
            assert_eq!(error.addr, "127.0.0.1:8300");
            Some(())
        }
    })
    .await;

    h.ddl_pump.abort();
}

#[tokio::test]
async fn test_unknown_sort_engine_is_fatal_at_construction() {
    let mem = Arc::new(MemStore::new());
    let client = CoordClient::new(Arc::clone(&mem) as Arc<dyn CoordStore>);
    client
        .put_changefeed_status(CF, &ChangeFeedStatus::default())
        .await
        .unwrap();

    let result = run_processor(ProcessorParams {
        store: mem,
        sink: Arc::new(CaptureSink::new()),
        schema: Arc::new(MemorySchemaStorage::new(SchemaSnapshot::empty(0))),
        puller_factory: Arc::new(ChannelPullerFactory::new()),
        changefeed_id: CF.into(),
        capture: CaptureInfo {
            id: CAPTURE.into(),
            advertise_addr: "127.0.0.1:8300".into(),
        },
        changefeed: ChangefeedInfo::default(),
        config: ChangefeedConfig {
            sort_engine: "bubble".into(),
            ..Default::default()
        },
        checkpoint_ts: 0,
    })
    .await;

    match result {
        Err(e) => assert_eq!(e.code(), "CDC:ErrUnknownSortEngine"),
        Ok(_) => panic!("construction should fail on an unknown sort engine"),
    }
}

// ===========================================================================
// Sort engines and cyclic mode through the full pipeline
// ===========================================================================

#[tokio::test]
async fn test_on_disk_sort_engine_end_to_end() {
    let sort_dir = tempfile::tempdir().unwrap();
    let config = ChangefeedConfig {
        sort_engine: "onDisk".into(),
        sort_dir: sort_dir.path().to_path_buf(),
        ..Default::default()
    };
    let h = start_harness(config).await;

    h.owner_add_table(99, 100).await;
    let feed = h.feed(99).await;
    // Out of order on purpose; the spill sorter restores commit order.
    feed.send(put_entry(99, 3, 180)).await;
    feed.send(put_entry(99, 1, 150)).await;
    feed.send(put_entry(99, 2, 160)).await;
    feed.send_resolved(1, 200).await;
    h.publish_global(200, 0).await;

    let sink = Arc::clone(&h.sink);
    wait_until("flush at 200", move || {
        sink.flushed_ts().contains(&200).then_some(())
    })
    .await;
    let commits: Vec<Ts> = h.sink.emitted_rows().iter().map(|r| r.commit_ts).collect();
    assert_eq!(commits, vec![150, 160, 180]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_cyclic_mark_table_clamps_watermark() {
    let config = ChangefeedConfig {
        cyclic_enabled: true,
        ..Default::default()
    };
    let h = start_harness(config).await;

    // Table 99 paired with mark table 1099.
    h.owner_update(|status| {
        status.tables.insert(
            99,
            ReplicaInfo {
                start_ts: 100,
                mark_table_id: 1099,
            },
        );
        status.operation.insert(99, TableOperation::default());
    })
    .await;

    let feed = h.feed(99).await;
    let mark_feed = h.feed(1099).await;

    // The user table races ahead; the mark table holds the watermark back.
    feed.send_resolved(1, 300).await;
    mark_feed.send_resolved(1, 250).await;
    h.publish_global(250, 0).await;

    let sink = Arc::clone(&h.sink);
    wait_until("flush clamped to mark table", move || {
        sink.flushed_ts().contains(&250).then_some(())
    })
    .await;
    assert!(h.sink.flushed_ts().iter().all(|ts| *ts <= 250));

    // Once the mark table catches up the watermark is released.
    mark_feed.send_resolved(1, 350).await;
    h.publish_global(300, 250).await;
    let sink = Arc::clone(&h.sink);
    wait_until("flush at 300", move || {
        sink.flushed_ts().contains(&300).then_some(())
    })
    .await;

    h.shutdown().await;
}
