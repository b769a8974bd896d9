//! Spill-to-disk sort engine.
//!
//! Backs both the `onDisk` and `unified` configurations: entries accumulate
//! in RAM and are written out as sorted run files once the resident budget
//! is exceeded (`onDisk` sets the budget to zero, so every flush passes
//! through disk). Each incoming watermark k-way merges the run files with
//! the resident tail, emits everything at or below the watermark, and
//! rewrites the remainder as a single carry run.
//!
//! Run files are JSON lines of raw entries, private to one sorter instance
//! and deleted as soon as they are merged.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drift_model::{Event, RawEntry, Ts};

use crate::error::PipelineError;
use crate::sorter::EventSorter;

const INPUT_QUEUE: usize = 4096;
const OUTPUT_QUEUE: usize = 4096;

/// Process-unique sorter ids keep run files of co-located tables apart.
static NEXT_SORTER_ID: AtomicU64 = AtomicU64::new(0);

pub struct FileSorter {
    dir: PathBuf,
    /// Resident bytes kept before spilling; `0` spills on every flush.
    spill_budget: usize,
    sorter_id: u64,
    input_tx: mpsc::Sender<Arc<Event>>,
    input_rx: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
    out_tx: mpsc::Sender<Arc<Event>>,
    out_rx: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
}

impl FileSorter {
    pub fn new(dir: &Path, spill_budget: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        Self {
            dir: dir.to_path_buf(),
            spill_budget,
            sorter_id: NEXT_SORTER_ID.fetch_add(1, Ordering::Relaxed),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
        }
    }
}

#[async_trait]
impl EventSorter for FileSorter {
    async fn add_entry(&self, event: Arc<Event>) {
        let _ = self.input_tx.send(event).await;
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut input = self
            .input_rx
            .lock()
            .unwrap()
            .take()
            .expect("sorter run started twice");
        let mut state = SpillState::new(&self.dir, self.sorter_id, self.spill_budget);

        let result = loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break Err(PipelineError::Cancelled),
                ev = input.recv() => match ev {
                    Some(ev) => ev,
                    None => break Ok(()),
                },
            };

            if event.is_resolved() {
                match state.flush(event.commit_ts) {
                    Ok(ready) => {
                        let mut closed = false;
                        for ev in ready {
                            if self.out_tx.send(ev).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed || self.out_tx.send(event).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(e),
                }
            } else if let Err(e) = state.push(event) {
                break Err(e);
            }
        };

        state.cleanup();
        result
    }

    fn take_output(&self) -> mpsc::Receiver<Arc<Event>> {
        self.out_rx
            .lock()
            .unwrap()
            .take()
            .expect("sorter output already taken")
    }
}

struct SpillState {
    dir: PathBuf,
    sorter_id: u64,
    spill_budget: usize,
    buffer: Vec<Arc<Event>>,
    buffered_bytes: usize,
    runs: Vec<PathBuf>,
    next_run: u64,
}

impl SpillState {
    fn new(dir: &Path, sorter_id: u64, spill_budget: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            sorter_id,
            spill_budget,
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
            next_run: 0,
        }
    }

    fn push(&mut self, event: Arc<Event>) -> Result<(), PipelineError> {
        self.buffered_bytes += event.raw.size();
        self.buffer.push(event);
        if self.spill_budget > 0 && self.buffered_bytes >= self.spill_budget {
            self.spill_buffer()?;
        }
        Ok(())
    }

    /// Release everything at or below `ts`, in commit order.
    fn flush(&mut self, ts: Ts) -> Result<Vec<Arc<Event>>, PipelineError> {
        self.buffer.sort_by_key(|e| e.commit_ts);

        if self.spill_budget == 0 && !self.buffer.is_empty() {
            self.spill_buffer()?;
        }

        if self.runs.is_empty() {
            let split = self.buffer.partition_point(|e| e.commit_ts <= ts);
            self.buffered_bytes = self
                .buffer
                .iter()
                .skip(split)
                .map(|e| e.raw.size())
                .sum();
            return Ok(self.buffer.drain(..split).collect());
        }

        self.merge(ts)
    }

    fn spill_buffer(&mut self) -> Result<(), PipelineError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by_key(|e| e.commit_ts);
        let path = self.run_path();
        let mut writer = BufWriter::new(File::create(&path)?);
        for event in self.buffer.drain(..) {
            serde_json::to_writer(&mut writer, &event.raw)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        self.buffered_bytes = 0;
        self.runs.push(path);
        Ok(())
    }

    /// K-way merge of run files plus the resident tail. Entries above `ts`
    /// come out of the merge still in order and are rewritten as a single
    /// carry run.
    fn merge(&mut self, ts: Ts) -> Result<Vec<Arc<Event>>, PipelineError> {
        let mut sources: Vec<MergeSource> = Vec::with_capacity(self.runs.len() + 1);
        for path in &self.runs {
            sources.push(MergeSource::from_run(path)?);
        }
        if !self.buffer.is_empty() {
            sources.push(MergeSource::from_memory(std::mem::take(&mut self.buffer)));
        }
        self.buffered_bytes = 0;

        let mut ready = Vec::new();
        let mut carry: Option<(PathBuf, BufWriter<File>)> = None;

        loop {
            let min = sources
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.peeked.as_ref().map(|e| (i, e.commit_ts)))
                .min_by_key(|&(_, ts)| ts);
            let Some((idx, _)) = min else { break };
            let event = sources[idx].pop()?;

            if event.commit_ts <= ts {
                ready.push(event);
            } else {
                if carry.is_none() {
                    let path = self.run_path();
                    let writer = BufWriter::new(File::create(&path)?);
                    carry = Some((path, writer));
                }
                let (_, writer) = carry.as_mut().unwrap();
                serde_json::to_writer(&mut *writer, &event.raw)?;
                writer.write_all(b"\n")?;
            }
        }

        for path in self.runs.drain(..) {
            let _ = std::fs::remove_file(path);
        }
        if let Some((path, mut writer)) = carry {
            writer.flush()?;
            self.runs.push(path);
        }
        Ok(ready)
    }

    fn run_path(&mut self) -> PathBuf {
        let path = self
            .dir
            .join(format!("drift-sort-{}-{}.jsonl", self.sorter_id, self.next_run));
        self.next_run += 1;
        path
    }

    fn cleanup(&mut self) {
        for path in self.runs.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct MergeSource {
    peeked: Option<Arc<Event>>,
    iter: Box<dyn Iterator<Item = Result<Arc<Event>, PipelineError>> + Send>,
}

impl MergeSource {
    fn from_run(path: &Path) -> Result<Self, PipelineError> {
        let reader = BufReader::new(File::open(path)?);
        let iter = reader.lines().map(|line| {
            let line = line?;
            let raw: RawEntry = serde_json::from_str(&line)?;
            Ok(Arc::new(Event::from_raw(raw)))
        });
        let mut source = Self {
            peeked: None,
            iter: Box::new(iter),
        };
        source.advance()?;
        Ok(source)
    }

    fn from_memory(events: Vec<Arc<Event>>) -> Self {
        let mut source = Self {
            peeked: None,
            iter: Box::new(events.into_iter().map(Ok)),
        };
        // Memory events cannot fail to "read".
        let _ = source.advance();
        source
    }

    fn pop(&mut self) -> Result<Arc<Event>, PipelineError> {
        let event = self.peeked.take().expect("pop on exhausted merge source");
        self.advance()?;
        Ok(event)
    }

    fn advance(&mut self) -> Result<(), PipelineError> {
        self.peeked = match self.iter.next() {
            Some(res) => Some(res?),
            None => None,
        };
        Ok(())
    }
}
