//! Target-ts gate and safe-stop state machine over a sorter.
//!
//! The rectifier owns its sorter's output: it tracks the largest watermark
//! seen, drops rows beyond the changefeed's target timestamp, and converts a
//! `safe_stop` request into a drained, terminal watermark so the scheduler
//! can tell exactly which timestamp the table stopped at.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::{Event, Ts};

use crate::error::PipelineError;
use crate::sorter::EventSorter;

const OUTPUT_QUEUE: usize = 4096;

/// Rectifier lifecycle. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RectifierStatus {
    Running = 0,
    /// `safe_stop` was requested; draining towards a terminal watermark.
    Stopping = 1,
    /// Drained and emitted its terminal watermark after a stop request.
    Stopped = 2,
    /// The sorter's watermark crossed the changefeed target.
    Finished = 3,
}

impl RectifierStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Stopping,
            2 => Self::Stopped,
            _ => Self::Finished,
        }
    }

    /// Stopped or Finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Finished)
    }
}

pub struct Rectifier {
    sorter: Arc<dyn EventSorter>,
    target_ts: Ts,
    status: AtomicU8,
    max_resolved_ts: AtomicU64,
    out_tx: mpsc::Sender<Arc<Event>>,
    out_rx: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
}

impl Rectifier {
    pub fn new(sorter: Arc<dyn EventSorter>, target_ts: Ts) -> Self {
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        Self {
            sorter,
            target_ts,
            status: AtomicU8::new(RectifierStatus::Running as u8),
            max_resolved_ts: AtomicU64::new(0),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
        }
    }

    /// Forward an entry into the underlying sorter.
    pub async fn add_entry(&self, event: Arc<Event>) {
        self.sorter.add_entry(event).await;
    }

    pub fn status(&self) -> RectifierStatus {
        RectifierStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Largest watermark emitted so far.
    pub fn max_resolved_ts(&self) -> Ts {
        self.max_resolved_ts.load(Ordering::Acquire)
    }

    /// Request a safe stop. Only a `Running` rectifier transitions; calls in
    /// any other state are no-ops.
    pub fn safe_stop(&self) {
        let _ = self.status.compare_exchange(
            RectifierStatus::Running as u8,
            RectifierStatus::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Take the single gated output stream.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn take_output(&self) -> mpsc::Receiver<Arc<Event>> {
        self.out_rx
            .lock()
            .unwrap()
            .take()
            .expect("rectifier output already taken")
    }

    fn set_status(&self, status: RectifierStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Drive the sorter and gate its output until terminal or cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut sorter_out = self.sorter.take_output();
        let sorter_cancel = cancel.child_token();
        let mut sorter_task = {
            let sorter = Arc::clone(&self.sorter);
            let token = sorter_cancel.clone();
            tokio::spawn(async move { sorter.run(token).await })
        };

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
                ev = sorter_out.recv() => match ev {
                    Some(ev) => ev,
                    None => break Ok(()),
                },
                res = &mut sorter_task => {
                    break match res {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) if e.is_cancelled() => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(join) => {
                            tracing::error!(error = %join, "sorter task aborted");
                            Err(PipelineError::ChannelClosed)
                        }
                    };
                }
            };

            if event.commit_ts > self.target_ts {
                if event.is_resolved() {
                    // Clamp to the target and finish; the pipeline's work is
                    // complete.
                    self.max_resolved_ts
                        .fetch_max(self.target_ts, Ordering::AcqRel);
                    self.set_status(RectifierStatus::Finished);
                    let terminal = Event::resolved(event.raw.region_id, self.target_ts);
                    let _ = self.out_tx.send(Arc::new(terminal)).await;
                    break Ok(());
                }
                // Rows beyond the target are dropped.
                continue;
            }

            if event.is_resolved() {
                self.max_resolved_ts
                    .fetch_max(event.commit_ts, Ordering::AcqRel);
                match self.status() {
                    RectifierStatus::Running => {
                        if event.commit_ts >= self.target_ts {
                            self.set_status(RectifierStatus::Finished);
                            let _ = self.out_tx.send(event).await;
                            break Ok(());
                        }
                        if self.out_tx.send(event).await.is_err() {
                            break Ok(());
                        }
                    }
                    RectifierStatus::Stopping => {
                        let terminal_ts = self.target_ts.min(event.commit_ts);
                        self.set_status(RectifierStatus::Stopped);
                        let terminal = Event::resolved(event.raw.region_id, terminal_ts);
                        let _ = self.out_tx.send(Arc::new(terminal)).await;
                        break Ok(());
                    }
                    // Absorbing; the loop has already exited by then.
                    RectifierStatus::Stopped | RectifierStatus::Finished => break Ok(()),
                }
            } else if self.out_tx.send(event).await.is_err() {
                break Ok(());
            }
        };

        sorter_cancel.cancel();
        result
    }
}
