// ABOUTME: WatermarkStore - per-table timestamp of the last successful extraction
// ABOUTME: Persists every watermark as one small table in the same table store

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::store::{TableStoreClient, WriteMode};
use crate::table::{Table, TargetTableRef};
use crate::utils::{retry_with_backoff, write_with_verification, RetryPolicy};

pub const DEFAULT_CONTAINER: &str = "extract-logs";
pub const DEFAULT_PATH: &str = "extract_logs";

const PATH_COLUMN: &str = "table_path";
const TIMESTAMP_COLUMN: &str = "last_extract_timestamp";
/// Column name used by watermark tables written by the older ingestion scripts.
const LEGACY_TIMESTAMP_COLUMN: &str = "last_extract_date";
const LEGACY_FORMAT: &str = "%Y-%m-%d,%H-%M-%S";

/// Point in time up to which a table's change feed has been consumed.
///
/// Always whole seconds in UTC. [`Watermark::never`] marks a table that has
/// never been synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// 1900-01-01T00:00:00Z
    pub fn never() -> Self {
        Self(
            Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self(timestamp.trunc_subsecs(0))
    }

    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_never(&self) -> bool {
        *self == Self::never()
    }

    /// Parse RFC 3339, or the legacy `YYYY-MM-DD,HH-MM-SS` text (taken as UTC).
    pub fn parse(text: &str) -> SyncResult<Self> {
        let text = text.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::at(ts.with_timezone(&Utc)));
        }
        for format in [LEGACY_FORMAT, "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Ok(Self::at(Utc.from_utc_datetime(&naive)));
            }
        }
        Err(SyncError::Schema(format!(
            "unrecognized watermark timestamp '{}'",
            text
        )))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Watermarks for every incrementally synchronized table.
///
/// The in-memory map mirrors the persisted table; `advance` rewrites the whole
/// table so there is exactly one place where watermarks become durable.
pub struct WatermarkStore {
    store: Arc<dyn TableStoreClient>,
    location: TargetTableRef,
    entries: BTreeMap<String, Watermark>,
    retry: RetryPolicy,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn TableStoreClient>, location: TargetTableRef, retry: RetryPolicy) -> Self {
        Self {
            store,
            location,
            entries: BTreeMap::new(),
            retry,
        }
    }

    pub fn location(&self) -> &TargetTableRef {
        &self.location
    }

    /// Refresh from the persisted table. A missing table means no watermarks yet.
    pub async fn load(&mut self) -> SyncResult<BTreeMap<String, Watermark>> {
        let store = self.store.as_ref();
        let location = &self.location;
        let persisted = retry_with_backoff(
            || store.read_table(location),
            &self.retry,
            "read watermark table",
        )
        .await;

        self.entries = match persisted {
            Ok(table) => entries_from_table(&table)?,
            Err(e) if e.is_not_found() => {
                tracing::debug!("No watermark table at {}, starting empty", self.location);
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        Ok(self.entries.clone())
    }

    /// Stored watermark, or [`Watermark::never`] when the path has none.
    pub fn get(&self, table_path: &str) -> Watermark {
        self.entries
            .get(table_path)
            .copied()
            .unwrap_or_else(Watermark::never)
    }

    pub fn entries(&self) -> &BTreeMap<String, Watermark> {
        &self.entries
    }

    /// Move a table's watermark forward and persist every watermark.
    ///
    /// Returns the watermark now in effect. An older timestamp never replaces a
    /// newer one. If persisting fails the in-memory value is rolled back.
    pub async fn advance(&mut self, table_path: &str, timestamp: DateTime<Utc>) -> SyncResult<Watermark> {
        let proposed = Watermark::at(timestamp);
        let previous = self.entries.get(table_path).copied();

        if let Some(current) = previous {
            if proposed < current {
                tracing::warn!(
                    "Ignoring watermark regression for {}: {} is older than {}",
                    table_path,
                    proposed,
                    current
                );
                return Ok(current);
            }
        }

        self.entries.insert(table_path.to_string(), proposed);
        if let Err(e) = self.persist().await {
            match previous {
                Some(current) => self.entries.insert(table_path.to_string(), current),
                None => self.entries.remove(table_path),
            };
            return Err(e);
        }

        tracing::info!("Advanced watermark for {} to {}", table_path, proposed);
        Ok(proposed)
    }

    /// The persisted form: one row per table path, timestamps as RFC 3339 text.
    pub fn to_table(&self) -> SyncResult<Table> {
        Table::from_rows(
            vec![PATH_COLUMN.to_string(), TIMESTAMP_COLUMN.to_string()],
            self.entries
                .iter()
                .map(|(path, watermark)| {
                    vec![Value::String(path.clone()), Value::String(watermark.to_string())]
                })
                .collect(),
        )
    }

    async fn persist(&self) -> SyncResult<()> {
        let table = self.to_table()?;
        let expected = table.digest();
        let store = self.store.as_ref();
        let location = &self.location;

        write_with_verification(
            || store.write_table(location, &table, WriteMode::Overwrite),
            || {
                let expected = &expected;
                async move { Ok(store.read_table(location).await?.digest() == *expected) }
            },
            &self.retry,
            "write watermark table",
        )
        .await
    }
}

fn entries_from_table(table: &Table) -> SyncResult<BTreeMap<String, Watermark>> {
    let path_idx = table.require_column(PATH_COLUMN, "watermark path")?;
    let ts_idx = table
        .column_index(TIMESTAMP_COLUMN)
        .or_else(|| table.column_index(LEGACY_TIMESTAMP_COLUMN))
        .ok_or_else(|| {
            SyncError::Schema(format!(
                "watermark table has neither '{}' nor '{}' column",
                TIMESTAMP_COLUMN, LEGACY_TIMESTAMP_COLUMN
            ))
        })?;

    let mut entries = BTreeMap::new();
    for row in table.rows() {
        let (Some(Value::String(path)), Some(Value::String(ts))) = (row.get(path_idx), row.get(ts_idx)) else {
            return Err(SyncError::Schema(format!(
                "malformed watermark row: {:?}",
                row
            )));
        };
        let watermark = Watermark::parse(ts)?;
        let path = path.trim_matches('/').to_string();
        entries
            .entry(path)
            .and_modify(|existing: &mut Watermark| *existing = (*existing).max(watermark))
            .or_insert(watermark);
    }
    Ok(entries)
}
