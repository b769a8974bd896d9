//! Upstream event-source contract and the channel-fed reference puller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::{RawEntry, RegionId, Ts};

use crate::error::PipelineError;
use crate::limiter::MemoryLimiter;
use crate::span::Span;

/// A stream of raw mutations for a set of key-ranges, starting from a given
/// timestamp.
///
/// The upstream contract: the source honours cancellation and never
/// emits a Resolved entry whose `commit_ts` is below any previously emitted
/// entry's `commit_ts` on the same region.
#[async_trait]
pub trait Puller: Send + Sync + 'static {
    /// Drive the puller until cancelled or the upstream ends.
    async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError>;

    /// Take the single output stream.
    ///
    /// # Panics
    ///
    /// Panics if called twice; there is exactly one consumer per puller.
    fn take_output(&self) -> mpsc::Receiver<RawEntry>;

    /// Largest upstream watermark observed so far. Seeds at the puller's
    /// start timestamp before any Resolved arrives.
    fn resolved_ts(&self) -> Ts;
}

/// Write-side handle feeding a [`ChannelPuller`]: the seam where an embedder
/// (or a test) plays the upstream store.
#[derive(Clone)]
pub struct PullerFeed {
    tx: mpsc::Sender<RawEntry>,
}

impl PullerFeed {
    /// Deliver one raw entry. Returns `false` once the puller is gone.
    pub async fn send(&self, entry: RawEntry) -> bool {
        self.tx.send(entry).await.is_ok()
    }

    /// Deliver a watermark for `region`.
    pub async fn send_resolved(&self, region: RegionId, ts: Ts) -> bool {
        self.send(RawEntry::resolved(region, ts)).await
    }

    /// Whether two feeds point at the same puller.
    pub fn same_channel(&self, other: &PullerFeed) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Reference [`Puller`] fed through an in-process channel.
///
/// Filters entries to its spans, accounts entry sizes against the shared
/// memory limiter (released downstream once the entry reaches the sorter)
/// and tracks the upstream watermark.
pub struct ChannelPuller {
    spans: Vec<Span>,
    resolved_ts: AtomicU64,
    limiter: Arc<MemoryLimiter>,
    feed_rx: Mutex<Option<mpsc::Receiver<RawEntry>>>,
    out_tx: mpsc::Sender<RawEntry>,
    out_rx: Mutex<Option<mpsc::Receiver<RawEntry>>>,
}

/// In-flight entries buffered between feed and consumer.
const PULLER_BUFFER: usize = 4096;

impl ChannelPuller {
    pub fn new(
        spans: Vec<Span>,
        start_ts: Ts,
        limiter: Arc<MemoryLimiter>,
    ) -> (Self, PullerFeed) {
        let (feed_tx, feed_rx) = mpsc::channel(PULLER_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(PULLER_BUFFER);
        let puller = Self {
            spans,
            resolved_ts: AtomicU64::new(start_ts),
            limiter,
            feed_rx: Mutex::new(Some(feed_rx)),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
        };
        (puller, PullerFeed { tx: feed_tx })
    }
}

#[async_trait]
impl Puller for ChannelPuller {
    async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut feed = self
            .feed_rx
            .lock()
            .unwrap()
            .take()
            .expect("puller run started twice");

        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                entry = feed.recv() => match entry {
                    Some(entry) => entry,
                    // Feed dropped: upstream is gone, end quietly.
                    None => return Ok(()),
                },
            };

            if entry.is_resolved() {
                self.resolved_ts.fetch_max(entry.commit_ts, Ordering::AcqRel);
            } else if !self.spans.iter().any(|s| s.contains(&entry.key)) {
                continue;
            }

            self.limiter.acquire(entry.size()).await;
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                res = self.out_tx.send(entry) => {
                    if res.is_err() {
                        return Err(PipelineError::ChannelClosed);
                    }
                }
            }
        }
    }

    fn take_output(&self) -> mpsc::Receiver<RawEntry> {
        self.out_rx
            .lock()
            .unwrap()
            .take()
            .expect("puller output already taken")
    }

    fn resolved_ts(&self) -> Ts {
        self.resolved_ts.load(Ordering::Acquire)
    }
}

/// Creates pullers for the processor's key-ranges.
///
/// The processor asks for one puller per table (plus one for the DDL range);
/// what actually talks to the upstream store lives behind this seam.
pub trait PullerFactory: Send + Sync + 'static {
    fn create(
        &self,
        spans: Vec<Span>,
        start_ts: Ts,
        limiter: Arc<MemoryLimiter>,
        enable_old_value: bool,
    ) -> Arc<dyn Puller>;
}

/// [`PullerFactory`] producing [`ChannelPuller`]s and keeping their feeds,
/// keyed by table id (`None` for the DDL range). Tests and in-process
/// embedders use the feeds to play the upstream store.
#[derive(Default)]
pub struct ChannelPullerFactory {
    feeds: Mutex<Vec<(Option<drift_model::TableId>, PullerFeed)>>,
}

impl ChannelPullerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently created feed for `table_id`. A table re-added while
    /// dying gets a fresh puller, so the latest feed is the live one.
    pub fn feed(&self, table_id: drift_model::TableId) -> Option<PullerFeed> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| *id == Some(table_id))
            .map(|(_, feed)| feed.clone())
    }

    /// Feed of the DDL-range puller.
    pub fn ddl_feed(&self) -> Option<PullerFeed> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id.is_none())
            .map(|(_, feed)| feed.clone())
    }
}

impl PullerFactory for ChannelPullerFactory {
    fn create(
        &self,
        spans: Vec<Span>,
        start_ts: Ts,
        limiter: Arc<MemoryLimiter>,
        _enable_old_value: bool,
    ) -> Arc<dyn Puller> {
        let key = spans.first().and_then(|s| s.table_id());
        let (puller, feed) = ChannelPuller::new(spans, start_ts, limiter);
        self.feeds.lock().unwrap().push((key, feed));
        Arc::new(puller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::table_span;
    use drift_model::{encode_row_key, OpType};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn put(table_id: i64, handle: i64, commit_ts: Ts) -> RawEntry {
        RawEntry {
            op: OpType::Put,
            key: encode_row_key(table_id, handle),
            value: Bytes::from_static(b"{}"),
            old_value: None,
            start_ts: commit_ts - 1,
            commit_ts,
            region_id: 1,
        }
    }

    #[tokio::test]
    async fn test_filters_to_spans_and_tracks_resolved() {
        let limiter = Arc::new(MemoryLimiter::new(usize::MAX));
        let (puller, feed) = ChannelPuller::new(vec![table_span(7, false)], 100, limiter);
        assert_eq!(puller.resolved_ts(), 100);

        let mut out = puller.take_output();
        let puller = Arc::new(puller);
        let cancel = CancellationToken::new();
        let run = {
            let puller = Arc::clone(&puller);
            let cancel = cancel.clone();
            tokio::spawn(async move { puller.run(cancel).await })
        };

        assert!(feed.send(put(7, 1, 150)).await);
        assert!(feed.send(put(8, 1, 151)).await); // foreign table, dropped
        assert!(feed.send_resolved(1, 200).await);

        let first = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
        assert_eq!(first.commit_ts, 150);
        let second = timeout(Duration::from_secs(2), out.recv()).await.unwrap().unwrap();
        assert!(second.is_resolved());
        assert_eq!(puller.resolved_ts(), 200);

        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_feed_drop_ends_run() {
        let limiter = Arc::new(MemoryLimiter::new(usize::MAX));
        let (puller, feed) = ChannelPuller::new(vec![table_span(7, false)], 0, limiter);
        let _out = puller.take_output();
        let puller = Arc::new(puller);
        let run = {
            let puller = Arc::clone(&puller);
            tokio::spawn(async move { puller.run(CancellationToken::new()).await })
        };
        drop(feed);
        timeout(Duration::from_secs(2), run)
            .await
            .expect("run should end when the feed closes")
            .unwrap()
            .unwrap();
    }
}
