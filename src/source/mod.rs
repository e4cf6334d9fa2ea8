// ABOUTME: Source boundary - SQL submission returning whole result sets
// ABOUTME: Builds the full-snapshot and change-feed queries the orchestrator issues

pub mod postgres;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::sync::watermark::Watermark;
use crate::table::Table;
use crate::utils::{quote_ident, quote_literal, quote_qualified_name, validate_identifier};

pub use postgres::PostgresSource;

/// Runs SQL against the relational source and returns the complete result set.
#[async_trait]
pub trait SourceQueryExecutor: Send + Sync {
    async fn query(&self, sql: &str) -> SyncResult<Table>;
}

/// `SELECT *` over a whole source table.
pub fn full_snapshot_query(source_table: &str) -> SyncResult<String> {
    validate_identifier(source_table)?;
    Ok(format!("SELECT * FROM {}", quote_qualified_name(source_table)))
}

/// Describes where a table's change feed lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFeedQuery {
    /// Table holding one row per mutation, e.g. `db.fact.table2_changes`
    pub changes_table: String,
    /// Column recording when each change row was created
    pub created_at_column: String,
}

impl ChangeFeedQuery {
    pub fn new(changes_table: impl Into<String>, created_at_column: impl Into<String>) -> Self {
        Self {
            changes_table: changes_table.into(),
            created_at_column: created_at_column.into(),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        validate_identifier(&self.changes_table)?;
        validate_identifier(&self.created_at_column)
    }

    /// Changes created strictly after `since`, oldest first.
    pub fn render(&self, since: Watermark) -> SyncResult<String> {
        self.validate()?;
        let created = quote_ident(&self.created_at_column);
        Ok(format!(
            "SELECT * FROM {} WHERE {} > {} ORDER BY {}",
            quote_qualified_name(&self.changes_table),
            created,
            quote_literal(&sql_timestamp(since)),
            created
        ))
    }
}

/// UTC timestamp literal the source can compare against its change column.
fn sql_timestamp(watermark: Watermark) -> String {
    watermark
        .timestamp()
        .to_rfc3339_opts(SecondsFormat::Secs, false)
        .replacen('T', " ", 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_full_snapshot_query() {
        assert_eq!(
            full_snapshot_query("db.fact.table1").unwrap(),
            "SELECT * FROM \"db\".\"fact\".\"table1\""
        );
        assert!(full_snapshot_query("table1; DROP TABLE x").is_err());
    }

    #[test]
    fn test_change_feed_from_sentinel_selects_all_history() {
        let feed = ChangeFeedQuery::new("db.fact.table2_changes", "date_created");
        let sql = feed.render(Watermark::never()).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"db\".\"fact\".\"table2_changes\" \
             WHERE \"date_created\" > '1900-01-01 00:00:00+00:00' ORDER BY \"date_created\""
        );
    }

    #[test]
    fn test_change_feed_bounded_by_watermark() {
        let feed = ChangeFeedQuery::new("changes", "created_at");
        let since = Watermark::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap());
        let sql = feed.render(since).unwrap();
        assert!(sql.contains("\"created_at\" > '2024-05-01 12:30:05+00:00'"));
    }

    #[test]
    fn test_change_feed_rejects_bad_identifiers() {
        let feed = ChangeFeedQuery::new("changes", "created' OR 1=1 --");
        assert!(feed.render(Watermark::never()).is_err());
    }
}
