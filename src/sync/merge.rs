// ABOUTME: ChangeSetMergeEngine - applies a batch of change rows to a target table by primary key
// ABOUTME: Computes an update/insert/delete plan locally so the caller persists it with one write

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{SyncError, SyncResult};
use crate::table::{KeyValue, Table};

/// Columns that give change rows their meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeKeys {
    pub primary_key: String,
    pub deleted_column: String,
    /// When set, a batch is ordered by this column before duplicate keys collapse.
    #[serde(default)]
    pub created_at_column: Option<String>,
}

impl MergeKeys {
    pub fn new(primary_key: impl Into<String>, deleted_column: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            deleted_column: deleted_column.into(),
            created_at_column: None,
        }
    }

    pub fn with_created_at(mut self, column: impl Into<String>) -> Self {
        self.created_at_column = Some(column.into());
        self
    }

    /// Positions of the primary key and deleted flag in a change-feed result.
    ///
    /// Holds for empty batches too, so a feed missing either column fails on
    /// its first read rather than its first non-empty one.
    pub fn check_change_schema(&self, changes: &Table) -> SyncResult<(usize, usize)> {
        let pk_idx = changes.require_column(&self.primary_key, "change-feed primary key")?;
        let deleted_idx = changes.require_column(&self.deleted_column, "change-feed deleted flag")?;
        Ok((pk_idx, deleted_idx))
    }

    fn is_control_column(&self, column: &str) -> bool {
        column == self.primary_key
            || column == self.deleted_column
            || self.created_at_column.as_deref() == Some(column)
    }
}

/// One mutation event from a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub primary_key: KeyValue,
    pub values: BTreeMap<String, Value>,
    pub deleted: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// Decode every row of a change-feed result.
    pub fn from_table(changes: &Table, keys: &MergeKeys) -> SyncResult<Vec<ChangeRecord>> {
        let (pk_idx, deleted_idx) = keys.check_change_schema(changes)?;
        let created_idx = keys
            .created_at_column
            .as_deref()
            .and_then(|column| changes.column_index(column));

        changes
            .rows()
            .iter()
            .map(|row| {
                let primary_key = KeyValue::from_value(&row[pk_idx]).ok_or_else(|| {
                    SyncError::Schema(format!(
                        "change row has null primary key '{}'",
                        keys.primary_key
                    ))
                })?;
                let deleted = parse_deleted_flag(&row[deleted_idx]).map_err(|e| {
                    SyncError::Schema(format!("change for key {}: {}", primary_key, e))
                })?;
                let created_at = created_idx.and_then(|idx| parse_change_timestamp(&row[idx]));
                let values = changes
                    .columns()
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();

                Ok(ChangeRecord {
                    primary_key,
                    values,
                    deleted,
                    created_at,
                })
            })
            .collect()
    }
}

/// Interpret a deletion flag. Null counts as not deleted.
pub fn parse_deleted_flag(value: &Value) -> SyncResult<bool> {
    let flag = match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "0" | "false" | "f" => Some(false),
            "1" | "true" | "t" => Some(true),
            _ => None,
        },
        _ => None,
    };
    flag.ok_or_else(|| SyncError::Schema(format!("unparseable deleted flag {}", value)))
}

fn parse_change_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// What a batch will do to a target, derived before anything is modified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub rows_to_update: Vec<ChangeRecord>,
    pub rows_to_insert: Vec<ChangeRecord>,
    pub keys_to_delete: BTreeSet<KeyValue>,
    /// Deleted records whose key the target never had
    pub skipped_deleted: usize,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.rows_to_update.is_empty() && self.rows_to_insert.is_empty() && self.keys_to_delete.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub updated: usize,
    pub inserted: usize,
    pub deleted: usize,
    pub skipped_deleted: usize,
}

impl MergeStats {
    /// Operations that changed the target.
    pub fn applied(&self) -> usize {
        self.updated + self.inserted + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub table: Table,
    pub stats: MergeStats,
}

/// Pure merge of a change batch into a table. Holds no state.
///
/// Updates overwrite the target columns a change carries and precede deletes.
/// Inserts are decided against the key set of the original target. Deleted
/// records for keys the target never had are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeSetMergeEngine;

impl ChangeSetMergeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Decode `changes` and merge them into `target`.
    pub fn merge(&self, target: Table, changes: &Table, keys: &MergeKeys) -> SyncResult<MergeOutcome> {
        let records = ChangeRecord::from_table(changes, keys)?;
        self.merge_records(target, records, keys)
    }

    pub fn merge_records(
        &self,
        target: Table,
        records: Vec<ChangeRecord>,
        keys: &MergeKeys,
    ) -> SyncResult<MergeOutcome> {
        let plan = self.plan(&target, records, keys)?;
        self.apply(target, plan, keys)
    }

    pub fn plan(&self, target: &Table, records: Vec<ChangeRecord>, keys: &MergeKeys) -> SyncResult<MergePlan> {
        let existing = index_keys(target, &keys.primary_key)?;
        check_data_columns(target, &records, keys)?;
        let mut plan = MergePlan::default();

        for record in latest_per_key(records) {
            match (existing.contains_key(&record.primary_key), record.deleted) {
                (true, true) => {
                    plan.keys_to_delete.insert(record.primary_key);
                }
                (true, false) => plan.rows_to_update.push(record),
                (false, false) => plan.rows_to_insert.push(record),
                (false, true) => {
                    tracing::debug!(
                        "Skipping delete for key {} absent from target",
                        record.primary_key
                    );
                    plan.skipped_deleted += 1;
                }
            }
        }
        Ok(plan)
    }

    pub fn apply(&self, target: Table, plan: MergePlan, keys: &MergeKeys) -> SyncResult<MergeOutcome> {
        let pk_idx = target.require_column(&keys.primary_key, "target primary key")?;
        let columns = target.columns().to_vec();
        let mut stats = MergeStats {
            skipped_deleted: plan.skipped_deleted,
            ..MergeStats::default()
        };

        let updates: HashMap<&KeyValue, &ChangeRecord> = plan
            .rows_to_update
            .iter()
            .map(|record| (&record.primary_key, record))
            .collect();

        let mut rows = Vec::with_capacity(target.num_rows() + plan.rows_to_insert.len());
        for mut row in target.into_rows() {
            let Some(key) = KeyValue::from_value(&row[pk_idx]) else {
                return Err(SyncError::Schema("target row has null primary key".to_string()));
            };
            if let Some(record) = updates.get(&key) {
                for (idx, column) in columns.iter().enumerate() {
                    if idx == pk_idx {
                        continue;
                    }
                    if let Some(value) = record.values.get(column) {
                        row[idx] = value.clone();
                    }
                }
                stats.updated += 1;
            }
            if plan.keys_to_delete.contains(&key) {
                stats.deleted += 1;
                continue;
            }
            rows.push(row);
        }

        for record in &plan.rows_to_insert {
            rows.push(
                columns
                    .iter()
                    .map(|column| record.values.get(column).cloned().unwrap_or(Value::Null))
                    .collect(),
            );
            stats.inserted += 1;
        }

        Ok(MergeOutcome {
            table: Table::from_rows(columns, rows)?,
            stats,
        })
    }
}

/// Map each target key to its row, rejecting null or repeated keys.
fn index_keys(target: &Table, primary_key: &str) -> SyncResult<HashMap<KeyValue, usize>> {
    let pk_idx = target.require_column(primary_key, "target primary key")?;
    let mut index = HashMap::with_capacity(target.num_rows());
    for (position, row) in target.rows().iter().enumerate() {
        let key = KeyValue::from_value(&row[pk_idx])
            .ok_or_else(|| SyncError::Schema(format!("target row {} has null primary key", position)))?;
        if index.insert(key.clone(), position).is_some() {
            return Err(SyncError::Schema(format!(
                "target has duplicate primary key {}",
                key
            )));
        }
    }
    Ok(index)
}

/// Every data column a change carries must exist in the target.
///
/// The key, deleted flag and created-at columns are exempt. Target columns a
/// change lacks are fine; change columns the target lacks are a mismatch.
fn check_data_columns(target: &Table, records: &[ChangeRecord], keys: &MergeKeys) -> SyncResult<()> {
    let mut checked: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        for column in record.values.keys() {
            if !checked.insert(column.as_str()) || keys.is_control_column(column) {
                continue;
            }
            if target.column_index(column).is_none() {
                return Err(SyncError::Schema(format!(
                    "change-feed column '{}' not found in target (available: {})",
                    column,
                    target.columns().join(", ")
                )));
            }
        }
    }
    Ok(())
}

/// Collapse a batch to one record per key, the latest one winning.
///
/// Records are ordered by `created_at` (stable) when every record has one;
/// otherwise feed order is kept. Output keeps first-appearance order of keys.
fn latest_per_key(mut records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    if records.iter().all(|r| r.created_at.is_some()) {
        records.sort_by_key(|r| r.created_at);
    }

    let mut positions: HashMap<KeyValue, usize> = HashMap::with_capacity(records.len());
    let mut latest: Vec<ChangeRecord> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(&record.primary_key) {
            Some(&position) => latest[position] = record,
            None => {
                positions.insert(record.primary_key.clone(), latest.len());
                latest.push(record);
            }
        }
    }
    latest
}
