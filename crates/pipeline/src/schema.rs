//! Multi-version schema snapshots.
//!
//! The mounter decodes each row against the schema as of `commit_ts - 1`.
//! Schema versions advance through DDL jobs applied in commit order; reads
//! at a timestamp the storage has not resolved yet suspend until the DDL
//! stream catches up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use drift_model::{DdlJob, DdlJobType, TableId, Ts};

use crate::error::PipelineError;

/// Shape of one table at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub id: TableId,
    pub schema_name: String,
    pub table_name: String,
    /// Column names in declaration order.
    pub columns: Vec<String>,
}

impl TableSchema {
    /// `schema.table`, used in logs and metrics labels.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

/// A read-consistent view of all table schemas at one version.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    version: Ts,
    tables: HashMap<TableId, Arc<TableSchema>>,
}

impl SchemaSnapshot {
    pub fn empty(version: Ts) -> Self {
        Self {
            version,
            tables: HashMap::new(),
        }
    }

    pub fn with_tables(version: Ts, tables: Vec<TableSchema>) -> Self {
        Self {
            version,
            tables: tables.into_iter().map(|t| (t.id, Arc::new(t))).collect(),
        }
    }

    pub fn version(&self) -> Ts {
        self.version
    }

    pub fn table_by_id(&self, id: TableId) -> Option<&Arc<TableSchema>> {
        self.tables.get(&id)
    }

    pub fn table_name(&self, id: TableId) -> Option<String> {
        self.tables.get(&id).map(|t| t.qualified_name())
    }
}

/// Contract of the schema-snapshot service.
#[async_trait]
pub trait SchemaStorage: Send + Sync + 'static {
    /// Snapshot as of `ts`, waiting until the storage has resolved that far.
    async fn snapshot_at(&self, ts: Ts) -> Result<Arc<SchemaSnapshot>, PipelineError>;

    /// The newest snapshot, without waiting.
    fn last_snapshot(&self) -> Arc<SchemaSnapshot>;

    /// Apply a DDL job. Jobs arrive in commit order; failure is fatal to the
    /// processor.
    fn handle_ddl_job(&self, job: &DdlJob) -> Result<(), PipelineError>;

    /// Raise the storage watermark: all DDL with `finished_ts <= ts` has
    /// been applied.
    fn advance_resolved_ts(&self, ts: Ts);

    fn resolved_ts(&self) -> Ts;

    /// Drop versions no reader can need anymore (floor `ts`). The newest
    /// version at or below the floor is retained to serve reads at the
    /// floor itself.
    fn do_gc(&self, ts: Ts);
}

/// In-memory [`SchemaStorage`].
pub struct MemorySchemaStorage {
    /// Versions in ascending `finished_ts` order; never empty.
    versions: Mutex<Vec<(Ts, Arc<SchemaSnapshot>)>>,
    resolved: watch::Sender<Ts>,
}

impl MemorySchemaStorage {
    /// Storage seeded with `initial`; resolved starts at the initial
    /// snapshot's version.
    pub fn new(initial: SchemaSnapshot) -> Self {
        let version = initial.version();
        let (resolved, _) = watch::channel(version);
        Self {
            versions: Mutex::new(vec![(version, Arc::new(initial))]),
            resolved,
        }
    }

    fn apply(job: &DdlJob, base: &SchemaSnapshot) -> Result<SchemaSnapshot, PipelineError> {
        let fail = |message: String| PipelineError::DdlApply {
            job_id: job.id,
            message,
        };

        let mut tables = base.tables.clone();
        match job.job_type {
            DdlJobType::CreateSchema => {}
            DdlJobType::CreateTable => {
                if tables.contains_key(&job.table_id) {
                    return Err(fail(format!("table {} already exists", job.table_id)));
                }
                tables.insert(
                    job.table_id,
                    Arc::new(TableSchema {
                        id: job.table_id,
                        schema_name: job.schema_name.clone(),
                        table_name: job.table_name.clone(),
                        columns: job.columns.clone(),
                    }),
                );
            }
            DdlJobType::DropTable => {
                if tables.remove(&job.table_id).is_none() {
                    return Err(fail(format!("table {} not found", job.table_id)));
                }
            }
            DdlJobType::AddColumn | DdlJobType::DropColumn => {
                let table = tables
                    .get(&job.table_id)
                    .ok_or_else(|| fail(format!("table {} not found", job.table_id)))?;
                let mut updated = (**table).clone();
                updated.columns = job.columns.clone();
                tables.insert(job.table_id, Arc::new(updated));
            }
        }
        Ok(SchemaSnapshot {
            version: job.finished_ts,
            tables,
        })
    }
}

#[async_trait]
impl SchemaStorage for MemorySchemaStorage {
    async fn snapshot_at(&self, ts: Ts) -> Result<Arc<SchemaSnapshot>, PipelineError> {
        let mut rx = self.resolved.subscribe();
        if *rx.borrow() < ts {
            rx.wait_for(|resolved| *resolved >= ts)
                .await
                .map_err(|_| PipelineError::Schema("schema storage closed".into()))?;
        }

        let versions = self.versions.lock().unwrap();
        versions
            .iter()
            .rev()
            .find(|(version, _)| *version <= ts)
            .map(|(_, snapshot)| Arc::clone(snapshot))
            .ok_or_else(|| PipelineError::Schema(format!("no schema snapshot at {ts}")))
    }

    fn last_snapshot(&self) -> Arc<SchemaSnapshot> {
        let versions = self.versions.lock().unwrap();
        Arc::clone(&versions.last().expect("storage seeded at construction").1)
    }

    fn handle_ddl_job(&self, job: &DdlJob) -> Result<(), PipelineError> {
        let mut versions = self.versions.lock().unwrap();
        let base = &versions.last().expect("storage seeded at construction").1;
        let next = Self::apply(job, base)?;
        versions.push((job.finished_ts, Arc::new(next)));
        Ok(())
    }

    fn advance_resolved_ts(&self, ts: Ts) {
        self.resolved.send_modify(|resolved| *resolved = (*resolved).max(ts));
    }

    fn resolved_ts(&self) -> Ts {
        *self.resolved.borrow()
    }

    fn do_gc(&self, ts: Ts) {
        let mut versions = self.versions.lock().unwrap();
        let keep_from = versions.partition_point(|(v, _)| *v <= ts).saturating_sub(1);
        versions.drain(..keep_from);
    }
}
