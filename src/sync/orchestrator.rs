// ABOUTME: SyncOrchestrator - sequences full and incremental loads per target table
// ABOUTME: Composes the source, the table store, the watermark store and the merge engine

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::time::{Interval, MissedTickBehavior};

use super::merge::{ChangeSetMergeEngine, MergeKeys, MergeStats};
use super::watermark::{Watermark, WatermarkStore};
use crate::error::{SyncError, SyncResult};
use crate::source::{full_snapshot_query, ChangeFeedQuery, SourceQueryExecutor};
use crate::store::{TableStoreClient, WriteMode};
use crate::table::{Table, TargetTableRef};
use crate::utils::{retry_with_backoff, validate_identifier, write_with_verification, RetryPolicy};

/// What a full load does when the target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FullLoadMode {
    /// Always replace the target with a fresh snapshot.
    Overwrite,
    /// Leave an existing target alone.
    #[serde(rename = "pass", alias = "pass_if_exists")]
    #[value(name = "pass")]
    PassIfExists,
}

impl fmt::Display for FullLoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FullLoadMode::Overwrite => write!(f, "overwrite"),
            FullLoadMode::PassIfExists => write!(f, "pass"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullLoadSpec {
    pub source_table: String,
    pub target: TargetTableRef,
    pub mode: FullLoadMode,
}

/// Everything needed to keep one target table in step with its change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalSpec {
    pub source_table: String,
    pub target: TargetTableRef,
    pub change_feed: ChangeFeedQuery,
    pub keys: MergeKeys,
}

impl IncrementalSpec {
    pub fn new(
        source_table: impl Into<String>,
        target: TargetTableRef,
        change_feed: ChangeFeedQuery,
        primary_key: impl Into<String>,
        deleted_column: impl Into<String>,
    ) -> Self {
        let keys = MergeKeys::new(primary_key, deleted_column)
            .with_created_at(change_feed.created_at_column.clone());
        Self {
            source_table: source_table.into(),
            target,
            change_feed,
            keys,
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        validate_identifier(&self.source_table)?;
        self.change_feed.validate()?;
        if self.keys.primary_key.trim().is_empty() || self.keys.deleted_column.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "{}: primary key and deleted column must be named",
                self.target
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullLoadOutcome {
    /// The target existed and the mode said to leave it.
    Skipped,
    Loaded { rows: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalOutcome {
    /// Result of making sure the target exists before merging
    pub initial_load: FullLoadOutcome,
    pub since: Watermark,
    pub changes_fetched: usize,
    pub stats: MergeStats,
    pub advanced_to: Watermark,
}

/// Steps of a load, used for progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    CheckExistence,
    Extract,
    Write,
    EnsureTargetExists,
    ReadWatermark,
    FetchChanges,
    Merge,
    AdvanceWatermark,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::CheckExistence => "CHECK_EXISTENCE",
            SyncPhase::Extract => "EXTRACT",
            SyncPhase::Write => "WRITE",
            SyncPhase::EnsureTargetExists => "ENSURE_TARGET_EXISTS",
            SyncPhase::ReadWatermark => "READ_WATERMARK",
            SyncPhase::FetchChanges => "FETCH_CHANGES",
            SyncPhase::Merge => "MERGE",
            SyncPhase::AdvanceWatermark => "ADVANCE_WATERMARK",
            SyncPhase::Done => "DONE",
        };
        f.write_str(name)
    }
}

fn enter(target: &TargetTableRef, phase: SyncPhase) {
    tracing::debug!("[{}] {}", target, phase);
}

/// The loads one cycle performs.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub full_loads: Vec<FullLoadSpec>,
    pub incremental: Vec<IncrementalSpec>,
    pub max_concurrent_tables: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.full_loads.is_empty() && self.incremental.is_empty()
    }
}

/// Statistics from a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub tables_synced: usize,
    pub tables_skipped: usize,
    pub rows_loaded: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if the sync cycle completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_full_load(&mut self, outcome: FullLoadOutcome) {
        match outcome {
            FullLoadOutcome::Skipped => self.tables_skipped += 1,
            FullLoadOutcome::Loaded { rows } => {
                self.tables_synced += 1;
                self.rows_loaded += rows as u64;
            }
        }
    }

    fn record_incremental(&mut self, outcome: &IncrementalOutcome) {
        self.tables_synced += 1;
        if let FullLoadOutcome::Loaded { rows } = outcome.initial_load {
            self.rows_loaded += rows as u64;
        }
        self.rows_inserted += outcome.stats.inserted as u64;
        self.rows_updated += outcome.stats.updated as u64;
        self.rows_deleted += outcome.stats.deleted as u64;
    }

    fn record_failure(&mut self, target: &TargetTableRef, error: &SyncError) {
        tracing::error!("Failed to sync {}: {}", target, error);
        self.errors.push(format!("{}: {}", target, error));
    }
}

/// One async lock per target table, created on first use.
#[derive(Default)]
struct TableLocks {
    locks: StdMutex<HashMap<TargetTableRef, Arc<Mutex<()>>>>,
}

impl TableLocks {
    async fn acquire(&self, target: &TargetTableRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(target.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Runs full and incremental loads.
///
/// Loads on the same target never overlap. Different targets may run
/// concurrently; they share only the watermark store, which is serialized.
pub struct SyncOrchestrator {
    source: Arc<dyn SourceQueryExecutor>,
    store: Arc<dyn TableStoreClient>,
    watermarks: Mutex<WatermarkStore>,
    engine: ChangeSetMergeEngine,
    locks: TableLocks,
    retry: RetryPolicy,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn SourceQueryExecutor>,
        store: Arc<dyn TableStoreClient>,
        watermarks: WatermarkStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            store,
            watermarks: Mutex::new(watermarks),
            engine: ChangeSetMergeEngine::new(),
            locks: TableLocks::default(),
            retry,
        }
    }

    /// Current persisted watermarks.
    pub async fn load_watermarks(&self) -> SyncResult<BTreeMap<String, Watermark>> {
        self.watermarks.lock().await.load().await
    }

    /// Copy a whole source table into the target.
    pub async fn full_load(
        &self,
        source_table: &str,
        target: &TargetTableRef,
        mode: FullLoadMode,
    ) -> SyncResult<FullLoadOutcome> {
        let _guard = self.locks.acquire(target).await;
        let outcome = self.full_load_locked(source_table, target, mode).await?;
        enter(target, SyncPhase::Done);
        Ok(outcome)
    }

    async fn full_load_locked(
        &self,
        source_table: &str,
        target: &TargetTableRef,
        mode: FullLoadMode,
    ) -> SyncResult<FullLoadOutcome> {
        let sql = full_snapshot_query(source_table)?;

        if mode == FullLoadMode::PassIfExists {
            enter(target, SyncPhase::CheckExistence);
            let store = self.store.as_ref();
            let exists =
                retry_with_backoff(|| store.exists(target), &self.retry, "check target existence").await?;
            if exists {
                tracing::debug!("{} already exists, skipping full load", target);
                return Ok(FullLoadOutcome::Skipped);
            }
        }

        enter(target, SyncPhase::Extract);
        let source = self.source.as_ref();
        let snapshot = retry_with_backoff(|| source.query(&sql), &self.retry, "extract source table").await?;

        enter(target, SyncPhase::Write);
        let rows = snapshot.num_rows();
        self.write_verified(target, &snapshot).await?;

        tracing::info!(
            "Full load of {} into {} complete: {} rows ({})",
            source_table,
            target,
            rows,
            mode
        );
        Ok(FullLoadOutcome::Loaded { rows })
    }

    /// Merge the changes recorded since the table's watermark into the target.
    pub async fn incremental_load(&self, spec: &IncrementalSpec) -> SyncResult<IncrementalOutcome> {
        spec.validate()?;
        let target = &spec.target;
        let _guard = self.locks.acquire(target).await;

        enter(target, SyncPhase::EnsureTargetExists);
        let initial_load = self
            .full_load_locked(&spec.source_table, target, FullLoadMode::PassIfExists)
            .await?;

        enter(target, SyncPhase::ReadWatermark);
        let since = {
            let mut watermarks = self.watermarks.lock().await;
            watermarks.load().await?;
            watermarks.get(target.table_path())
        };

        enter(target, SyncPhase::FetchChanges);
        // Taken before the query so changes created while it runs are not skipped
        let cycle_time = Utc::now();
        let sql = spec.change_feed.render(since)?;
        let source = self.source.as_ref();
        let changes = retry_with_backoff(|| source.query(&sql), &self.retry, "fetch changes").await?;
        let changes_fetched = changes.num_rows();
        spec.keys.check_change_schema(&changes)?;

        let stats = if changes.is_empty() {
            tracing::debug!("No changes for {} since {}", target, since);
            MergeStats::default()
        } else {
            enter(target, SyncPhase::Merge);
            let store = self.store.as_ref();
            let current =
                retry_with_backoff(|| store.read_table(target), &self.retry, "read target table").await?;
            let outcome = self.engine.merge(current, &changes, &spec.keys)?;

            if outcome.stats.applied() > 0 {
                enter(target, SyncPhase::Write);
                self.write_verified(target, &outcome.table).await?;
            }
            outcome.stats
        };

        enter(target, SyncPhase::AdvanceWatermark);
        let advanced_to = {
            let mut watermarks = self.watermarks.lock().await;
            watermarks.load().await?;
            watermarks.advance(target.table_path(), cycle_time).await?
        };

        enter(target, SyncPhase::Done);
        tracing::info!(
            "Incremental load of {} complete: {} changes, {} updated, {} inserted, {} deleted",
            target,
            changes_fetched,
            stats.updated,
            stats.inserted,
            stats.deleted
        );

        Ok(IncrementalOutcome {
            initial_load,
            since,
            changes_fetched,
            stats,
            advanced_to,
        })
    }

    /// Overwrite a target, reading it back after a transient failure instead of
    /// writing blindly again.
    async fn write_verified(&self, target: &TargetTableRef, table: &Table) -> SyncResult<()> {
        let expected = table.digest();
        let store = self.store.as_ref();
        write_with_verification(
            || store.write_table(target, table, WriteMode::Overwrite),
            || {
                let expected = &expected;
                async move { Ok(store.read_table(target).await?.digest() == *expected) }
            },
            &self.retry,
            &format!("write {}", target),
        )
        .await
    }

    /// Run every full load, then every incremental load.
    ///
    /// Tables within each group run concurrently up to the plan's limit. A
    /// failing table is recorded in the returned stats and does not stop the others.
    pub async fn run_plan(&self, plan: &SyncPlan) -> SyncStats {
        let start = Instant::now();
        let limit = plan.max_concurrent_tables.max(1);
        let mut stats = SyncStats::default();

        let full_results: Vec<_> = stream::iter(plan.full_loads.iter().map(|spec| async move {
            (
                &spec.target,
                self.full_load(&spec.source_table, &spec.target, spec.mode).await,
            )
        }))
        .buffer_unordered(limit)
        .collect()
        .await;

        for (target, result) in full_results {
            match result {
                Ok(outcome) => stats.record_full_load(outcome),
                Err(e) => stats.record_failure(target, &e),
            }
        }

        let incremental_results: Vec<_> = stream::iter(
            plan.incremental
                .iter()
                .map(|spec| async move { (&spec.target, self.incremental_load(spec).await) }),
        )
        .buffer_unordered(limit)
        .collect()
        .await;

        for (target, result) in incremental_results {
            match result {
                Ok(outcome) => stats.record_incremental(&outcome),
                Err(e) => stats.record_failure(target, &e),
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    /// Run the plan every `interval` until shutdown is signalled.
    ///
    /// A shutdown arriving mid-cycle abandons the cycle at its next await point;
    /// each table's merge and write is a single storage call, and its watermark
    /// only advances after that call has landed. Returns the number of completed
    /// cycles.
    pub async fn run_watch(
        &self,
        plan: &SyncPlan,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> u64 {
        let mut ticker = watch_ticker(interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Watching {} full and {} incremental loads every {:?}",
            plan.full_loads.len(),
            plan.incremental.len(),
            interval
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping");
                    break;
                }
                _ = ticker.tick() => {
                    tracing::info!("Starting sync cycle {}", cycles + 1);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync cycle, aborting");
                            break;
                        }
                        stats = self.run_plan(plan) => {
                            cycles += 1;
                            tracing::info!(
                                "Sync cycle {} completed: {} tables, {} skipped in {}ms",
                                cycles,
                                stats.tables_synced,
                                stats.tables_skipped,
                                stats.duration_ms
                            );
                            if !stats.is_success() {
                                tracing::warn!("Sync cycle had {} errors", stats.errors.len());
                            }
                        }
                    }
                }
            }
        }

        cycles
    }
}

/// Cycle schedule for watch mode. A cycle that overruns the interval pushes
/// the next one back instead of triggering catch-up cycles.
fn watch_ticker(interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
