//! In-process reference store.
//!
//! Single-node implementation of [`CoordStore`] backed by a mutex-guarded
//! map plus a bounded change log for watch replay. Used by the test suites
//! and by embedders that run owner and processor in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::store::{CoordStore, KeyValue, WatchEvent};

/// Change-log entries retained for watch replay before compaction kicks in.
const DEFAULT_LOG_CAPACITY: usize = 4096;

struct Stored {
    value: Vec<u8>,
    mod_revision: i64,
}

enum LogKind {
    Put(Vec<u8>),
    Delete,
}

struct LogEntry {
    revision: i64,
    key: String,
    kind: LogKind,
}

struct Watcher {
    key: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct Inner {
    revision: i64,
    compacted_revision: i64,
    kvs: HashMap<String, Stored>,
    log: VecDeque<LogEntry>,
    watchers: Vec<Watcher>,
}

/// In-memory [`CoordStore`].
pub struct MemStore {
    inner: Mutex<Inner>,
    log_capacity: usize,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// A store whose replay log holds at most `capacity` entries; older
    /// entries are compacted away, which lets tests exercise the
    /// [`WatchEvent::Compacted`] path cheaply.
    pub fn with_log_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                compacted_revision: 0,
                kvs: HashMap::new(),
                log: VecDeque::new(),
                watchers: Vec::new(),
            }),
            log_capacity: capacity.max(1),
        }
    }

    /// Raise the compaction floor, discarding replay history at or below
    /// `revision`.
    pub fn compact(&self, revision: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.compacted_revision = inner.compacted_revision.max(revision);
        while inner
            .log
            .front()
            .is_some_and(|e| e.revision <= revision)
        {
            inner.log.pop_front();
        }
    }

    /// Current store revision, for tests.
    pub fn revision(&self) -> i64 {
        self.inner.lock().unwrap().revision
    }

    fn append(inner: &mut Inner, log_capacity: usize, key: &str, kind: LogKind) -> i64 {
        inner.revision += 1;
        let revision = inner.revision;
        inner.log.push_back(LogEntry {
            revision,
            key: key.to_string(),
            kind: match &kind {
                LogKind::Put(v) => LogKind::Put(v.clone()),
                LogKind::Delete => LogKind::Delete,
            },
        });
        while inner.log.len() > log_capacity {
            let dropped = inner.log.pop_front().unwrap();
            inner.compacted_revision = inner.compacted_revision.max(dropped.revision);
        }

        let event = match kind {
            LogKind::Put(value) => {
                inner.kvs.insert(
                    key.to_string(),
                    Stored {
                        value: value.clone(),
                        mod_revision: revision,
                    },
                );
                WatchEvent::Put(KeyValue {
                    value,
                    mod_revision: revision,
                })
            }
            LogKind::Delete => {
                inner.kvs.remove(key);
                WatchEvent::Delete
            }
        };

        inner
            .watchers
            .retain(|w| w.key != key || w.tx.send(event.clone()).is_ok());
        revision
    }
}

#[async_trait]
impl CoordStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.kvs.get(key).map(|s| KeyValue {
            value: s.value.clone(),
            mod_revision: s.mod_revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::append(&mut inner, self.log_capacity, key, LogKind::Put(value)))
    }

    async fn cas(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_mod_revision: i64,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let actual = inner.kvs.get(key).map_or(0, |s| s.mod_revision);
        if actual != expected_mod_revision {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected_mod_revision,
                actual,
            });
        }
        Ok(Self::append(&mut inner, self.log_capacity, key, LogKind::Put(value)))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.kvs.contains_key(key) {
            Self::append(&mut inner, self.log_capacity, key, LogKind::Delete);
        }
        Ok(())
    }

    async fn watch(
        &self,
        key: &str,
        from_revision: i64,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();

        if from_revision != 0 && from_revision <= inner.compacted_revision {
            let _ = tx.send(WatchEvent::Compacted);
            return Ok(rx);
        }

        for entry in inner.log.iter().filter(|e| e.key == key) {
            if entry.revision < from_revision {
                continue;
            }
            let event = match &entry.kind {
                LogKind::Put(value) => WatchEvent::Put(KeyValue {
                    value: value.clone(),
                    mod_revision: entry.revision,
                }),
                LogKind::Delete => WatchEvent::Delete,
            };
            let _ = tx.send(event);
        }

        inner.watchers.push(Watcher {
            key: key.to_string(),
            tx,
        });
        Ok(rx)
    }
}
