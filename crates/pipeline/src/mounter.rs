//! Shared decode pool.
//!
//! A single mounter serves every table pipeline of a processor: sorted
//! events are pushed onto one shared queue, `worker_num` workers decode the
//! raw bytes against the schema snapshot at `commit_ts - 1`, attach the
//! resulting row change and fire each event's readiness latch. Ordering is
//! not preserved here; consumers re-establish it by awaiting each event's
//! latch in emission order.
//!
//! Backpressure on the shared queue slows all sorters equally.

use std::sync::Arc;

use crossfire::{MAsyncRx, MAsyncTx};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use drift_model::{decode_row_key, decode_row_value, Column, Event, OpType, RawEntry, RowChange};

use crate::error::PipelineError;
use crate::schema::{SchemaSnapshot, SchemaStorage};

pub struct Mounter {
    input_tx: MAsyncTx<Arc<Event>>,
    input_rx: MAsyncRx<Arc<Event>>,
    schema: Arc<dyn SchemaStorage>,
    worker_num: usize,
    enable_old_value: bool,
}

impl Mounter {
    pub fn new(
        schema: Arc<dyn SchemaStorage>,
        worker_num: usize,
        enable_old_value: bool,
        queue_size: usize,
    ) -> Self {
        let (input_tx, input_rx) = crossfire::mpmc::bounded_async(queue_size);
        Self {
            input_tx,
            input_rx,
            schema,
            worker_num: worker_num.max(1),
            enable_old_value,
        }
    }

    /// Sender side of the shared queue; one clone per producer.
    pub fn input(&self) -> MAsyncTx<Arc<Event>> {
        self.input_tx.clone()
    }

    /// Run the worker pool. Returns the first worker error (schema-storage
    /// failures abort the processor); remaining workers are torn down with
    /// the pool.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_num {
            let rx = self.input_rx.clone();
            let schema = Arc::clone(&self.schema);
            let enable_old_value = self.enable_old_value;
            let cancel = cancel.clone();
            workers.spawn(async move {
                worker_loop(worker_id, rx, schema, enable_old_value, cancel).await
            });
        }

        while let Some(res) = workers.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(join) => {
                    tracing::error!(error = %join, "mounter worker aborted");
                    return Err(PipelineError::ChannelClosed);
                }
            }
        }
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: MAsyncRx<Arc<Event>>,
    schema: Arc<dyn SchemaStorage>,
    enable_old_value: bool,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    tracing::debug!(worker_id, "mounter worker starting");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            ev = rx.recv() => match ev {
                Ok(ev) => ev,
                // All producers gone; quiet exit.
                Err(_) => return Ok(()),
            },
        };

        mount_event(&event, &schema, enable_old_value).await?;
        event.mark_prepared();
    }
}

async fn mount_event(
    event: &Event,
    schema: &Arc<dyn SchemaStorage>,
    enable_old_value: bool,
) -> Result<(), PipelineError> {
    if event.is_resolved() {
        return Ok(());
    }

    // Schema-storage failures are fatal; decode failures only skip the row.
    let snapshot = schema.snapshot_at(event.commit_ts.saturating_sub(1)).await?;
    match decode_row(&event.raw, &snapshot, enable_old_value) {
        Ok(row) => event.set_row(Some(row)),
        Err(reason) => {
            tracing::warn!(
                commit_ts = event.commit_ts,
                reason,
                "failed to decode row, skipping"
            );
            event.set_row(None);
        }
    }
    Ok(())
}

fn decode_row(
    raw: &RawEntry,
    snapshot: &SchemaSnapshot,
    enable_old_value: bool,
) -> Result<RowChange, String> {
    let (table_id, handle) = decode_row_key(&raw.key).map_err(|e| e.to_string())?;
    let table = snapshot
        .table_by_id(table_id)
        .ok_or_else(|| format!("table {table_id} not in schema snapshot"))?;

    let is_delete = raw.op == OpType::Delete;
    let columns = if is_delete {
        Vec::new()
    } else {
        decode_columns(&raw.value, &table.columns)?
    };
    let pre_columns = match (&raw.old_value, enable_old_value) {
        (Some(old), true) => Some(decode_columns(old, &table.columns)?),
        _ => None,
    };

    Ok(RowChange {
        table_id,
        schema: table.schema_name.clone(),
        table: table.table_name.clone(),
        commit_ts: raw.commit_ts,
        start_ts: raw.start_ts,
        handle,
        is_delete,
        columns,
        pre_columns,
    })
}

fn decode_columns(value: &[u8], schema_columns: &[String]) -> Result<Vec<Column>, String> {
    let mut values = decode_row_value(value).map_err(|e| e.to_string())?;
    Ok(schema_columns
        .iter()
        .map(|name| {
            let value = values.remove(name).unwrap_or(serde_json::Value::Null);
            Column::new(name, value)
        })
        .collect())
}
