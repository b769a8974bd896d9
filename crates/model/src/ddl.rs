//! DDL jobs applied to the schema storage.

use serde::{Deserialize, Serialize};

use crate::ts::Ts;
use crate::TableId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlJobType {
    CreateSchema,
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
}

/// A schema-changing job, decoded from the DDL key-range and applied to the
/// schema storage in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlJob {
    pub id: i64,
    pub job_type: DdlJobType,
    pub schema_name: String,
    pub table_name: String,
    pub table_id: TableId,
    /// Column names after the job completes (for table-shape jobs).
    #[serde(default)]
    pub columns: Vec<String>,
    /// Original DDL statement, informational only.
    #[serde(default)]
    pub query: String,
    /// Commit timestamp at which the job takes effect.
    pub finished_ts: Ts,
}
