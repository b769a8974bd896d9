//! MemStore and CoordClient tests: CAS guards, watch replay, compaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use drift_model::{ChangeFeedStatus, ReplicaInfo, TaskPosition, TaskStatus};

use crate::{CoordClient, CoordStore, MemStore, StoreError, WatchEvent};

async fn recv_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<WatchEvent>,
) -> WatchEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch channel closed")
}

#[tokio::test]
async fn test_get_put_revisions_increase() {
    let store = MemStore::new();
    assert!(store.get("/a").await.unwrap().is_none());

    let r1 = store.put("/a", b"1".to_vec()).await.unwrap();
    let r2 = store.put("/a", b"2".to_vec()).await.unwrap();
    assert!(r2 > r1);

    let kv = store.get("/a").await.unwrap().unwrap();
    assert_eq!(kv.value, b"2");
    assert_eq!(kv.mod_revision, r2);
}

#[tokio::test]
async fn test_cas_guard() {
    let store = MemStore::new();

    // Revision 0 means "create".
    let r1 = store.cas("/a", b"1".to_vec(), 0).await.unwrap();

    // Stale guard loses.
    let err = store.cas("/a", b"x".to_vec(), 0).await.unwrap_err();
    assert!(err.is_conflict());

    // Fresh guard wins.
    let r2 = store.cas("/a", b"2".to_vec(), r1).await.unwrap();
    assert!(r2 > r1);
    assert_eq!(store.get("/a").await.unwrap().unwrap().value, b"2");
}

#[tokio::test]
async fn test_watch_replays_history_then_streams() {
    let store = MemStore::new();
    let r1 = store.put("/job/cf", b"1".to_vec()).await.unwrap();
    store.put("/other", b"x".to_vec()).await.unwrap();
    store.put("/job/cf", b"2".to_vec()).await.unwrap();

    // Watch from just past the first write: replay must deliver only the
    // second write, then live events follow.
    let mut rx = store.watch("/job/cf", r1 + 1).await.unwrap();
    match recv_event(&mut rx).await {
        WatchEvent::Put(kv) => assert_eq!(kv.value, b"2"),
        other => panic!("unexpected event: {other:?}"),
    }

    store.put("/job/cf", b"3".to_vec()).await.unwrap();
    match recv_event(&mut rx).await {
        WatchEvent::Put(kv) => assert_eq!(kv.value, b"3"),
        other => panic!("unexpected event: {other:?}"),
    }

    store.delete("/job/cf").await.unwrap();
    assert!(matches!(recv_event(&mut rx).await, WatchEvent::Delete));
}

#[tokio::test]
async fn test_watch_below_compaction_floor() {
    let store = MemStore::new();
    let r1 = store.put("/a", b"1".to_vec()).await.unwrap();
    store.put("/a", b"2".to_vec()).await.unwrap();
    store.compact(r1);

    let mut rx = store.watch("/a", r1).await.unwrap();
    assert!(matches!(recv_event(&mut rx).await, WatchEvent::Compacted));
}

#[tokio::test]
async fn test_log_overflow_compacts() {
    let store = MemStore::with_log_capacity(2);
    let r1 = store.put("/a", b"1".to_vec()).await.unwrap();
    for i in 0..4 {
        store.put("/a", vec![i]).await.unwrap();
    }
    // History for r1 is gone.
    let mut rx = store.watch("/a", r1).await.unwrap();
    assert!(matches!(recv_event(&mut rx).await, WatchEvent::Compacted));
}

#[tokio::test]
async fn test_client_task_status_roundtrip() {
    let client = CoordClient::new(Arc::new(MemStore::new()));

    let (rev, status) = client.get_task_status("cf", "cap").await.unwrap();
    assert_eq!(rev, 0);
    assert!(status.tables.is_empty());

    let mut status = TaskStatus::default();
    status.tables.insert(
        99,
        ReplicaInfo {
            start_ts: 100,
            mark_table_id: 0,
        },
    );
    let rev = client
        .put_task_status("cf", "cap", &status, 0)
        .await
        .unwrap();

    let (rev2, read) = client.get_task_status("cf", "cap").await.unwrap();
    assert_eq!(rev2, rev);
    assert_eq!(read.tables[&99].start_ts, 100);

    // Stale CAS from a racing writer.
    let err = client
        .put_task_status("cf", "cap", &status, rev - 1)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
}

#[tokio::test]
async fn test_client_position_on_change_skips_identical() {
    let client = CoordClient::new(Arc::new(MemStore::new()));
    let pos = TaskPosition {
        checkpoint_ts: 10,
        resolved_ts: 20,
        error: None,
    };

    assert!(client
        .put_task_position_on_change("cf", "cap", &pos)
        .await
        .unwrap());
    assert!(!client
        .put_task_position_on_change("cf", "cap", &pos)
        .await
        .unwrap());

    let advanced = TaskPosition {
        checkpoint_ts: 15,
        ..pos
    };
    assert!(client
        .put_task_position_on_change("cf", "cap", &advanced)
        .await
        .unwrap());
    assert_eq!(
        client.get_task_position("cf", "cap").await.unwrap().unwrap(),
        advanced
    );
}

#[tokio::test]
async fn test_client_changefeed_status_missing_then_watch() {
    let store = Arc::new(MemStore::new());
    let client = CoordClient::new(store.clone());

    assert!(matches!(
        client.get_changefeed_status("cf").await.unwrap_err(),
        StoreError::NotFound(_)
    ));

    let status = ChangeFeedStatus {
        resolved_ts: 200,
        checkpoint_ts: 100,
    };
    client.put_changefeed_status("cf", &status).await.unwrap();

    let (read, rev) = client.get_changefeed_status("cf").await.unwrap();
    assert_eq!(read, status);

    let mut rx = client.watch_changefeed_status("cf", rev + 1).await.unwrap();
    let next = ChangeFeedStatus {
        resolved_ts: 300,
        checkpoint_ts: 200,
    };
    client.put_changefeed_status("cf", &next).await.unwrap();
    match recv_event(&mut rx).await {
        WatchEvent::Put(kv) => {
            let decoded: ChangeFeedStatus = serde_json::from_slice(&kv.value).unwrap();
            assert_eq!(decoded, next);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_task_keys() {
    let store = Arc::new(MemStore::new());
    let client = CoordClient::new(store.clone());

    let status = TaskStatus::default();
    client.put_task_status("cf", "cap", &status, 0).await.unwrap();
    client
        .put_task_position_on_change("cf", "cap", &TaskPosition::new(1))
        .await
        .unwrap();
    client
        .put_task_workload("cf", "cap", &Default::default())
        .await
        .unwrap();

    client.delete_task_keys("cf", "cap").await.unwrap();
    assert!(store.get("/task/status/cf/cap").await.unwrap().is_none());
    assert!(store.get("/task/position/cf/cap").await.unwrap().is_none());
    assert!(store.get("/task/workload/cf/cap").await.unwrap().is_none());
}
