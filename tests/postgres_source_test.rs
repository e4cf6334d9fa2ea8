// ABOUTME: Integration tests for PostgresSource against a live database
// ABOUTME: Requires TEST_SOURCE_URL; run with `cargo test -- --ignored`

use lake_replicator::source::{full_snapshot_query, ChangeFeedQuery, PostgresSource, SourceQueryExecutor};
use lake_replicator::store::{MemoryTableStore, TableStoreClient};
use lake_replicator::sync::watermark::{self, Watermark, WatermarkStore};
use lake_replicator::sync::{IncrementalSpec, SyncOrchestrator};
use lake_replicator::table::TargetTableRef;
use lake_replicator::utils::RetryPolicy;
use serde_json::json;
use std::env;
use std::sync::Arc;

/// Helper to get the test database URL from environment
fn get_test_url() -> Option<String> {
    env::var("TEST_SOURCE_URL").ok()
}

async fn admin_client(url: &str) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .expect("Failed to connect for setup");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

#[tokio::test]
#[ignore]
async fn test_query_converts_column_types() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let admin = admin_client(&url).await;
    admin
        .batch_execute(
            r#"
            DROP TABLE IF EXISTS "public"."lake_types_test";
            CREATE TABLE "public"."lake_types_test" (
                id INTEGER PRIMARY KEY,
                name TEXT,
                price NUMERIC(10, 2),
                active BOOLEAN,
                created TIMESTAMPTZ,
                payload JSONB,
                missing TEXT
            );
            INSERT INTO "public"."lake_types_test" VALUES
                (1, 'one', 12.50, true, '2024-05-01 12:00:00+00', '{"k": 1}', NULL);
            "#,
        )
        .await
        .expect("Failed to setup test table");

    let source = PostgresSource::connect(&url, RetryPolicy::no_retry())
        .await
        .expect("Failed to connect");
    let table = source
        .query(&full_snapshot_query("public.lake_types_test").unwrap())
        .await
        .expect("Query failed");

    assert_eq!(
        table.columns(),
        &["id", "name", "price", "active", "created", "payload", "missing"]
    );
    assert_eq!(
        table.rows()[0],
        vec![
            json!(1),
            json!("one"),
            json!("12.50"),
            json!(true),
            json!("2024-05-01T12:00:00Z"),
            json!({"k": 1}),
            serde_json::Value::Null,
        ]
    );

    let _ = admin
        .batch_execute(r#"DROP TABLE IF EXISTS "public"."lake_types_test""#)
        .await;
}

#[tokio::test]
#[ignore]
async fn test_incremental_load_against_change_table() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let admin = admin_client(&url).await;
    admin
        .batch_execute(
            r#"
            DROP TABLE IF EXISTS "public"."lake_items";
            DROP TABLE IF EXISTS "public"."lake_items_changes";
            CREATE TABLE "public"."lake_items" (id INTEGER PRIMARY KEY, val TEXT);
            CREATE TABLE "public"."lake_items_changes" (
                id INTEGER, val TEXT, deleted INTEGER, date_created TIMESTAMPTZ
            );
            INSERT INTO "public"."lake_items" VALUES (1, 'a'), (2, 'b');
            "#,
        )
        .await
        .expect("Failed to setup test tables");

    let source = Arc::new(
        PostgresSource::connect(&url, RetryPolicy::no_retry())
            .await
            .expect("Failed to connect"),
    );
    let store = Arc::new(MemoryTableStore::new());
    let watermarks = WatermarkStore::new(
        store.clone(),
        TargetTableRef::new(watermark::DEFAULT_CONTAINER, watermark::DEFAULT_PATH),
        RetryPolicy::no_retry(),
    );
    let orchestrator = SyncOrchestrator::new(source, store.clone(), watermarks, RetryPolicy::no_retry());
    let spec = IncrementalSpec::new(
        "public.lake_items",
        TargetTableRef::new("source-data", "source_data/lake_items"),
        ChangeFeedQuery::new("public.lake_items_changes", "date_created"),
        "id",
        "deleted",
    );

    let first = orchestrator.incremental_load(&spec).await.expect("First load failed");
    assert!(first.since.is_never());
    assert_eq!(first.changes_fetched, 0);

    admin
        .batch_execute(
            r#"
            INSERT INTO "public"."lake_items_changes" VALUES
                (1, 'a', 1, now() + interval '1 minute'),
                (2, 'newval', 0, now() + interval '1 minute'),
                (3, 'c', 0, now() + interval '1 minute');
            "#,
        )
        .await
        .expect("Failed to insert changes");

    let second = orchestrator.incremental_load(&spec).await.expect("Second load failed");
    assert!(second.since > Watermark::never());
    assert_eq!(second.changes_fetched, 3);

    let merged = store.read_table(&spec.target).await.unwrap();
    assert_eq!(
        merged.rows(),
        &[vec![json!(2), json!("newval")], vec![json!(3), json!("c")]]
    );

    let _ = admin
        .batch_execute(
            r#"
            DROP TABLE IF EXISTS "public"."lake_items";
            DROP TABLE IF EXISTS "public"."lake_items_changes";
            "#,
        )
        .await;
}
