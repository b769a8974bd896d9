//! Mounter pool tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use drift_model::{encode_row_key, Event, OpType, RawEntry, Ts};

use crate::schema::{MemorySchemaStorage, SchemaSnapshot, SchemaStorage, TableSchema};
use crate::Mounter;

fn test_schema(resolved: Ts) -> Arc<MemorySchemaStorage> {
    let snapshot = SchemaSnapshot::with_tables(
        0,
        vec![TableSchema {
            id: 7,
            schema_name: "db".into(),
            table_name: "users".into(),
            columns: vec!["id".into(), "name".into()],
        }],
    );
    let storage = Arc::new(MemorySchemaStorage::new(snapshot));
    storage.advance_resolved_ts(resolved);
    storage
}

fn put_event(table_id: i64, handle: i64, commit_ts: Ts, value: serde_json::Value) -> Arc<Event> {
    let ev = Event::from_raw(RawEntry {
        op: OpType::Put,
        key: encode_row_key(table_id, handle),
        value: Bytes::from(serde_json::to_vec(&value).unwrap()),
        old_value: None,
        start_ts: commit_ts - 1,
        commit_ts,
        region_id: 1,
    });
    ev.arm_prepared();
    Arc::new(ev)
}

fn start_mounter(storage: Arc<MemorySchemaStorage>, enable_old_value: bool) -> Arc<Mounter> {
    let mounter = Arc::new(Mounter::new(storage, 2, enable_old_value, 64));
    let run = Arc::clone(&mounter);
    tokio::spawn(async move { run.run(CancellationToken::new()).await });
    mounter
}

async fn wait_prepared(ev: &Arc<Event>) {
    timeout(Duration::from_secs(2), ev.wait_prepared())
        .await
        .expect("event should become prepared");
}

#[tokio::test]
async fn test_decodes_put_against_snapshot() {
    let mounter = start_mounter(test_schema(1000), false);
    let ev = put_event(7, 42, 150, json!({"id": 42, "name": "drift"}));

    mounter.input().send(Arc::clone(&ev)).await.unwrap();
    wait_prepared(&ev).await;

    let row = ev.row().expect("row decoded");
    assert_eq!(row.table_id, 7);
    assert_eq!(row.schema, "db");
    assert_eq!(row.table, "users");
    assert_eq!(row.handle, 42);
    assert!(!row.is_delete);
    assert_eq!(row.columns.len(), 2);
    assert_eq!(row.columns[0].name, "id");
    assert_eq!(row.columns[0].value, json!(42));
    assert_eq!(row.columns[1].value, json!("drift"));
}

#[tokio::test]
async fn test_unknown_table_skips_row_without_aborting() {
    let mounter = start_mounter(test_schema(1000), false);
    let bad = put_event(999, 1, 150, json!({"id": 1}));
    let good = put_event(7, 1, 151, json!({"id": 1, "name": "x"}));

    mounter.input().send(Arc::clone(&bad)).await.unwrap();
    mounter.input().send(Arc::clone(&good)).await.unwrap();

    wait_prepared(&bad).await;
    wait_prepared(&good).await;
    assert!(bad.row().is_none());
    assert!(good.row().is_some());
}

#[tokio::test]
async fn test_resolved_events_latch_through() {
    let mounter = start_mounter(test_schema(1000), false);
    let ev = Arc::new(Event::resolved(1, 500));
    ev.arm_prepared();
    mounter.input().send(Arc::clone(&ev)).await.unwrap();
    wait_prepared(&ev).await;
    assert!(ev.row().is_none());
}

#[tokio::test]
async fn test_delete_carries_old_value_when_enabled() {
    let storage = test_schema(1000);
    let mounter = start_mounter(storage, true);

    let ev = Event::from_raw(RawEntry {
        op: OpType::Delete,
        key: encode_row_key(7, 5),
        value: Bytes::new(),
        old_value: Some(Bytes::from(
            serde_json::to_vec(&json!({"id": 5, "name": "gone"})).unwrap(),
        )),
        start_ts: 149,
        commit_ts: 150,
        region_id: 1,
    });
    ev.arm_prepared();
    let ev = Arc::new(ev);

    mounter.input().send(Arc::clone(&ev)).await.unwrap();
    wait_prepared(&ev).await;

    let row = ev.row().expect("delete decoded");
    assert!(row.is_delete);
    assert!(row.columns.is_empty());
    let pre = row.pre_columns.as_ref().expect("old value decoded");
    assert_eq!(pre[1].value, json!("gone"));
}

#[tokio::test]
async fn test_decode_waits_for_schema_resolved() {
    // Storage resolved only to 100; a row at 150 must wait.
    let storage = test_schema(100);
    let mounter = start_mounter(Arc::clone(&storage), false);
    let ev = put_event(7, 1, 150, json!({"id": 1, "name": "late"}));

    mounter.input().send(Arc::clone(&ev)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ev.row().is_none());

    storage.advance_resolved_ts(200);
    wait_prepared(&ev).await;
    assert!(ev.row().is_some());
}
