// ABOUTME: MemoryTableStore - in-process table store for tests and dry runs
// ABOUTME: Keeps every written version and can inject write failures

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{TableStoreClient, WriteMode};
use crate::error::{SyncError, SyncResult};
use crate::table::{Table, TargetTableRef};

/// Error a failing write reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Store,
    Auth,
}

impl FailureKind {
    fn to_error(self, message: String) -> SyncError {
        match self {
            FailureKind::Transient => SyncError::Transient(message),
            FailureKind::Store => SyncError::Store(message),
            FailureKind::Auth => SyncError::Auth(message),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    remaining: u32,
    kind: FailureKind,
}

#[derive(Debug, Default)]
struct Inner {
    versions: HashMap<TargetTableRef, Vec<Table>>,
    failures: HashMap<TargetTableRef, InjectedFailure>,
    access_denied: bool,
    rejected_calls: u64,
    writes: u64,
}

/// Table store that lives in memory. Every write appends a new version.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    inner: Mutex<Inner>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a table without counting it as a write.
    pub fn insert(&self, table: &TargetTableRef, data: Table) {
        self.lock()
            .versions
            .entry(table.clone())
            .or_default()
            .push(data);
    }

    /// Latest content of a table, if any.
    pub fn snapshot(&self, table: &TargetTableRef) -> Option<Table> {
        self.lock()
            .versions
            .get(table)
            .and_then(|versions| versions.last().cloned())
    }

    /// Number of versions written to a table (including seeded ones).
    pub fn version_count(&self, table: &TargetTableRef) -> usize {
        self.lock().versions.get(table).map_or(0, Vec::len)
    }

    /// Total successful writes across all tables.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Make the next `count` writes to `table` fail without landing.
    pub fn fail_writes(&self, table: &TargetTableRef, count: u32, kind: FailureKind) {
        self.lock().failures.insert(
            table.clone(),
            InjectedFailure {
                remaining: count,
                kind,
            },
        );
    }

    /// Reject every call with an authentication error until access is restored.
    pub fn deny_access(&self, denied: bool) {
        self.lock().access_denied = denied;
    }

    /// Calls refused while access was denied.
    pub fn rejected_calls(&self) -> u64 {
        self.lock().rejected_calls
    }

    fn check_access(&self, table: &TargetTableRef) -> SyncResult<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        if inner.access_denied {
            inner.rejected_calls += 1;
            return Err(SyncError::Auth(format!("access to {} denied", table)));
        }
        Ok(inner)
    }
}

#[async_trait]
impl TableStoreClient for MemoryTableStore {
    async fn exists(&self, table: &TargetTableRef) -> SyncResult<bool> {
        Ok(self
            .check_access(table)?
            .versions
            .get(table)
            .is_some_and(|versions| !versions.is_empty()))
    }

    async fn read_table(&self, table: &TargetTableRef) -> SyncResult<Table> {
        self.check_access(table)?
            .versions
            .get(table)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| SyncError::NotFound(table.to_string()))
    }

    async fn write_table(
        &self,
        table: &TargetTableRef,
        data: &Table,
        mode: WriteMode,
    ) -> SyncResult<()> {
        let mut inner = self.check_access(table)?;

        if let Some(failure) = inner.failures.get_mut(table) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                return Err(failure
                    .kind
                    .to_error(format!("injected write failure for {}", table)));
            }
        }

        let versions = inner.versions.entry(table.clone()).or_default();
        let content = match (mode, versions.last()) {
            (WriteMode::Append, Some(latest)) => {
                let mut merged = latest.clone();
                merged.append(data.clone())?;
                merged
            }
            _ => data.clone(),
        };
        versions.push(content);
        inner.writes += 1;
        Ok(())
    }
}
