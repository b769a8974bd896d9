//! Edge-triggered, coalescing wake-ups.
//!
//! A [`Notifier`] converts a level ("something changed, maybe many times")
//! into an edge ("wake up once"). Any number of [`Notifier::notify`] calls
//! between two receiver ticks collapse into a single tick, and a receiver
//! never ticks more often than its configured minimum interval. Used to
//! debounce watermark updates.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Clone, Copy, Default)]
struct State {
    seq: u64,
    closed: bool,
}

/// Non-blocking wake-up source. Cheap to share; `notify()` never suspends.
pub struct Notifier {
    tx: watch::Sender<State>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(State::default());
        Self { tx }
    }

    /// Signal all receivers. Signals delivered while a receiver is pacing
    /// coalesce into its next tick.
    pub fn notify(&self) {
        self.tx.send_modify(|s| s.seq = s.seq.wrapping_add(1));
    }

    /// Create a receiver that ticks at most once per `min_interval`.
    ///
    /// Only signals sent after this call are observed.
    pub fn receiver(&self, min_interval: Duration) -> Receiver {
        Receiver {
            rx: self.tx.subscribe(),
            min_interval,
            last_tick: None,
        }
    }

    /// Permanently close the notifier; pending and future ticks on all
    /// receivers resolve to `None`. Idempotent.
    pub fn close(&self) {
        self.tx.send_if_modified(|s| {
            if s.closed {
                false
            } else {
                s.closed = true;
                true
            }
        });
    }
}

/// Receiving side of a [`Notifier`].
pub struct Receiver {
    rx: watch::Receiver<State>,
    min_interval: Duration,
    last_tick: Option<Instant>,
}

impl Receiver {
    /// Wait for the next coalesced tick. Returns `None` once the notifier is
    /// closed or dropped.
    ///
    /// Cancellation-safe: the pacing sleep runs before the signal edge is
    /// consumed, so a `tick` future dropped by a `select!` never swallows a
    /// wake-up.
    pub async fn tick(&mut self) -> Option<()> {
        if let Some(last) = self.last_tick {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        if self.rx.changed().await.is_err() {
            return None;
        }
        if self.rx.borrow().closed {
            return None;
        }
        self.last_tick = Some(Instant::now());
        Some(())
    }
}
