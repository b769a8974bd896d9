//! In-memory sort-on-resolved engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::Event;

use crate::error::PipelineError;
use crate::sorter::EventSorter;

/// Watermarks queued between `add_entry` and the run loop.
const RESOLVED_QUEUE: usize = 256;

/// Sorted events buffered towards the consumer.
const OUTPUT_QUEUE: usize = 4096;

/// Buffers row events in RAM; each incoming watermark stably sorts the
/// buffer by `commit_ts` and flushes everything at or below it, followed by
/// the watermark itself. Events above the watermark stay buffered until a
/// later watermark covers them.
pub struct MemorySorter {
    buffer: Mutex<Vec<Arc<Event>>>,
    resolved_tx: mpsc::Sender<Arc<Event>>,
    resolved_rx: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
    out_tx: mpsc::Sender<Arc<Event>>,
    out_rx: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
}

impl Default for MemorySorter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySorter {
    pub fn new() -> Self {
        let (resolved_tx, resolved_rx) = mpsc::channel(RESOLVED_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        Self {
            buffer: Mutex::new(Vec::new()),
            resolved_tx,
            resolved_rx: Mutex::new(Some(resolved_rx)),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
        }
    }

    /// Drain the buffer up to `ts`, returning the ready prefix in commit
    /// order.
    fn take_ready(&self, ts: drift_model::Ts) -> Vec<Arc<Event>> {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.sort_by_key(|e| e.commit_ts);
        let split = buffer.partition_point(|e| e.commit_ts <= ts);
        buffer.drain(..split).collect()
    }
}

#[async_trait]
impl EventSorter for MemorySorter {
    async fn add_entry(&self, event: Arc<Event>) {
        if event.is_resolved() {
            // A closed run loop means the pipeline is tearing down.
            let _ = self.resolved_tx.send(event).await;
        } else {
            self.buffer.lock().unwrap().push(event);
        }
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut resolved_rx = self
            .resolved_rx
            .lock()
            .unwrap()
            .take()
            .expect("sorter run started twice");

        loop {
            let resolved = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                ev = resolved_rx.recv() => match ev {
                    Some(ev) => ev,
                    None => return Ok(()),
                },
            };

            for event in self.take_ready(resolved.commit_ts) {
                if self.out_tx.send(event).await.is_err() {
                    // Consumer reached a terminal state; end quietly.
                    return Ok(());
                }
            }
            if self.out_tx.send(resolved).await.is_err() {
                return Ok(());
            }
        }
    }

    fn take_output(&self) -> mpsc::Receiver<Arc<Event>> {
        self.out_rx
            .lock()
            .unwrap()
            .take()
            .expect("sorter output already taken")
    }
}
