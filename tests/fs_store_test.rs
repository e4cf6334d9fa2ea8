// ABOUTME: Integration tests for the filesystem table store
// ABOUTME: Covers versioned snapshots, append mode, pruning and watermark persistence on disk

use chrono::{TimeZone, Utc};
use lake_replicator::store::{FsTableStore, TableStoreClient, WriteMode};
use lake_replicator::sync::watermark::{self, Watermark, WatermarkStore};
use lake_replicator::table::{Table, TargetTableRef};
use lake_replicator::utils::RetryPolicy;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn table(ids: &[i64]) -> Table {
    Table::from_rows(
        vec!["id".to_string(), "name".to_string()],
        ids.iter()
            .map(|id| vec![json!(id), json!(format!("row-{}", id))])
            .collect(),
    )
    .unwrap()
}

fn target() -> TargetTableRef {
    TargetTableRef::new("source-data", "source_data/table1")
}

#[tokio::test]
async fn test_missing_table_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = FsTableStore::new(dir.path());

    assert!(!store.exists(&target()).await.unwrap());
    let err = store.read_table(&target()).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_overwrite_publishes_new_version() {
    let dir = TempDir::new().unwrap();
    let store = FsTableStore::new(dir.path());

    store
        .write_table(&target(), &table(&[1, 2]), WriteMode::Overwrite)
        .await
        .unwrap();
    store
        .write_table(&target(), &table(&[3]), WriteMode::Overwrite)
        .await
        .unwrap();

    assert!(store.exists(&target()).await.unwrap());
    assert_eq!(store.read_table(&target()).await.unwrap(), table(&[3]));
    assert_eq!(store.list_versions(&target()).await.unwrap(), vec![1, 2]);
    assert!(dir
        .path()
        .join("source-data/source_data/table1/_versions/00000000000000000002.json")
        .exists());
}

#[tokio::test]
async fn test_append_extends_latest_version() {
    let dir = TempDir::new().unwrap();
    let store = FsTableStore::new(dir.path());

    store
        .write_table(&target(), &table(&[1]), WriteMode::Append)
        .await
        .unwrap();
    store
        .write_table(&target(), &table(&[2, 3]), WriteMode::Append)
        .await
        .unwrap();
    assert_eq!(store.read_table(&target()).await.unwrap(), table(&[1, 2, 3]));

    let other_schema = Table::from_rows(vec!["other".to_string()], vec![vec![json!(1)]]).unwrap();
    assert!(store
        .write_table(&target(), &other_schema, WriteMode::Append)
        .await
        .is_err());
    assert_eq!(store.list_versions(&target()).await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_retained_versions_are_pruned() {
    let dir = TempDir::new().unwrap();
    let store = FsTableStore::new(dir.path()).with_retained_versions(2);

    for id in 1..=4 {
        store
            .write_table(&target(), &table(&[id]), WriteMode::Overwrite)
            .await
            .unwrap();
    }

    assert_eq!(store.list_versions(&target()).await.unwrap(), vec![3, 4]);
    assert_eq!(store.read_table(&target()).await.unwrap(), table(&[4]));
}

#[tokio::test]
async fn test_pruning_removes_leftover_temp_files() {
    let dir = TempDir::new().unwrap();
    let store = FsTableStore::new(dir.path()).with_retained_versions(2);
    store
        .write_table(&target(), &table(&[1]), WriteMode::Overwrite)
        .await
        .unwrap();

    // Left behind by a write that died between creating and renaming its file
    let versions_dir = store.versions_dir(&target()).unwrap();
    let leftover = versions_dir.join(".0b6f3d2e-interrupted.tmp");
    tokio::fs::write(&leftover, b"{\"partial").await.unwrap();
    assert_eq!(store.list_versions(&target()).await.unwrap(), vec![1]);

    store
        .write_table(&target(), &table(&[2]), WriteMode::Overwrite)
        .await
        .unwrap();

    assert!(!leftover.exists());
    assert_eq!(store.list_versions(&target()).await.unwrap(), vec![1, 2]);
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&versions_dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    assert_eq!(names, vec!["00000000000000000001.json", "00000000000000000002.json"]);
}

#[tokio::test]
async fn test_tables_in_same_container_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = FsTableStore::new(dir.path());
    let sibling = TargetTableRef::new("source-data", "source_data/table2");

    store
        .write_table(&target(), &table(&[1]), WriteMode::Overwrite)
        .await
        .unwrap();

    assert!(!store.exists(&sibling).await.unwrap());
    assert!(!store
        .exists(&TargetTableRef::new("source-data", "source_data"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_watermarks_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let location = TargetTableRef::new(watermark::DEFAULT_CONTAINER, watermark::DEFAULT_PATH);
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    {
        let store = Arc::new(FsTableStore::new(dir.path()));
        let mut watermarks = WatermarkStore::new(store, location.clone(), RetryPolicy::no_retry());
        watermarks.load().await.unwrap();
        watermarks.advance("source_data/table2", at).await.unwrap();
    }

    let store = Arc::new(FsTableStore::new(dir.path()));
    let mut watermarks = WatermarkStore::new(store, location, RetryPolicy::no_retry());
    let entries = watermarks.load().await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(watermarks.get("source_data/table2"), Watermark::at(at));
    assert!(dir
        .path()
        .join("extract-logs/extract_logs/_versions")
        .is_dir());
}
