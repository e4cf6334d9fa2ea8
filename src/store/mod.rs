// ABOUTME: Table store boundary - existence checks, whole-table reads and writes
// ABOUTME: Implemented over a filesystem namespace, an HTTPS endpoint, or memory

pub mod fs;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::table::{Table, TargetTableRef};

pub use fs::FsTableStore;
pub use http::HttpTableStore;
pub use memory::MemoryTableStore;

/// How a write treats an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Replace the whole table content.
    Overwrite,
    /// Add rows after the existing ones. Columns must match.
    Append,
}

/// Whole-table access to the lake.
///
/// Every write is a single call that either lands completely or not at all.
/// A missing table is reported as [`SyncError::NotFound`](crate::error::SyncError::NotFound),
/// never as a generic I/O failure.
#[async_trait]
pub trait TableStoreClient: Send + Sync {
    async fn exists(&self, table: &TargetTableRef) -> SyncResult<bool>;

    async fn read_table(&self, table: &TargetTableRef) -> SyncResult<Table>;

    async fn write_table(
        &self,
        table: &TargetTableRef,
        data: &Table,
        mode: WriteMode,
    ) -> SyncResult<()>;
}

/// On-disk / on-wire representation of one table version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDocument {
    pub written_at: DateTime<Utc>,
    #[serde(flatten)]
    pub table: Table,
}

impl TableDocument {
    pub fn new(table: Table) -> Self {
        Self {
            written_at: Utc::now(),
            table,
        }
    }
}
