// ABOUTME: In-memory table model shared by the source, the store and the merge engine
// ABOUTME: Named columns, JSON-valued cells, and table identity in the lake namespace

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Identifies one logical table in the lake: a container plus a path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetTableRef {
    container: String,
    table_path: String,
}

impl TargetTableRef {
    /// Create a reference. Leading and trailing slashes on the path are insignificant.
    pub fn new(container: impl Into<String>, table_path: impl AsRef<str>) -> Self {
        Self {
            container: container.into(),
            table_path: table_path.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn table_path(&self) -> &str {
        &self.table_path
    }
}

impl fmt::Display for TargetTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.table_path)
    }
}

/// A single row, positionally aligned with [`Table::columns`].
pub type Row = Vec<Value>;

/// A whole table held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    /// Create an empty table with the given schema.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Create a table from rows, checking that every row matches the schema width.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> SyncResult<Self> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Position of a column the caller cannot proceed without.
    pub fn require_column(&self, name: &str, role: &str) -> SyncResult<usize> {
        self.column_index(name).ok_or_else(|| {
            SyncError::Schema(format!(
                "{} column '{}' not found (available: {})",
                role,
                name,
                self.columns.join(", ")
            ))
        })
    }

    pub fn push_row(&mut self, row: Row) -> SyncResult<()> {
        if row.len() != self.columns.len() {
            return Err(SyncError::Schema(format!(
                "row has {} values but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append every row of `other`. Both tables must have identical columns.
    pub fn append(&mut self, other: Table) -> SyncResult<()> {
        if self.columns != other.columns {
            return Err(SyncError::Schema(format!(
                "cannot append rows with columns [{}] to table with columns [{}]",
                other.columns.join(", "),
                self.columns.join(", ")
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Look up a cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Content fingerprint (SHA-256 of the canonical JSON encoding).
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for column in &self.columns {
            hasher.update(column.as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"#");
        for row in &self.rows {
            for value in row {
                hasher.update(value.to_string().as_bytes());
                hasher.update(b"|");
            }
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Canonical text form of a primary-key value.
///
/// Keys are matched by their text rendering, so `1` in the change feed matches `1` in
/// the target regardless of how either side typed it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyValue(String);

impl KeyValue {
    /// Returns `None` for SQL NULL, which can never identify a row.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(KeyValue(s.clone())),
            other => Some(KeyValue(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
