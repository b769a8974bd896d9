//! Commit-order re-sequencing for the DDL stream.
//!
//! The DDL puller's raw output arrives in region order; this stage re-orders
//! it by `commit_ts` within each watermark window, the same contract the
//! per-table sorters provide for row data.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::RawEntry;

const OUTPUT_QUEUE: usize = 128;

/// Spawn the ordering task over `input`; the returned stream yields entries
/// in non-decreasing `commit_ts`, each watermark following everything it
/// covers.
pub fn sort_raw_output(
    mut input: mpsc::Receiver<RawEntry>,
    cancel: CancellationToken,
) -> mpsc::Receiver<RawEntry> {
    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
    tokio::spawn(async move {
        let mut buffer: Vec<RawEntry> = Vec::new();
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => return,
                entry = input.recv() => match entry {
                    Some(entry) => entry,
                    None => return,
                },
            };

            if entry.is_resolved() {
                buffer.sort_by_key(|e| e.commit_ts);
                let split = buffer.partition_point(|e| e.commit_ts <= entry.commit_ts);
                for ready in buffer.drain(..split) {
                    if tx.send(ready).await.is_err() {
                        return;
                    }
                }
                if tx.send(entry).await.is_err() {
                    return;
                }
            } else {
                buffer.push(entry);
            }
        }
    });
    rx
}
