// ABOUTME: PostgresSource - SourceQueryExecutor backed by tokio-postgres
// ABOUTME: Converts result rows to JSON cells by PostgreSQL type and reconnects when closed

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Config, NoTls, Row};

use super::SourceQueryExecutor;
use crate::error::{SyncError, SyncResult};
use crate::table::Table;
use crate::utils::{retry_with_backoff, sanitize_url, RetryPolicy};

/// Relational source reached over the PostgreSQL wire protocol.
pub struct PostgresSource {
    config: Config,
    display_url: String,
    retry: RetryPolicy,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresSource {
    /// Connect to the source, retrying transient connection failures.
    pub async fn connect(url: &str, retry: RetryPolicy) -> SyncResult<Self> {
        let config: Config = url
            .parse()
            .map_err(|e| SyncError::Config(format!("invalid source URL: {}", e)))?;
        let source = Self {
            config,
            display_url: sanitize_url(url),
            retry,
            client: Mutex::new(None),
        };
        source.client().await?;
        Ok(source)
    }

    /// The live client, reconnecting first if the previous connection closed.
    async fn client(&self) -> SyncResult<Arc<Client>> {
        let mut held = self.client.lock().await;
        if let Some(client) = held.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::warn!("Connection to {} closed, reconnecting", self.display_url);
        }

        let client = retry_with_backoff(
            || connect_once(&self.config),
            &self.retry,
            "connect to source database",
        )
        .await?;
        tracing::info!("Connected to source database {}", self.display_url);

        let client = Arc::new(client);
        *held = Some(client.clone());
        Ok(client)
    }
}

async fn connect_once(config: &Config) -> SyncResult<Client> {
    if config.get_ssl_mode() == SslMode::Disable {
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Source connection error: {}", e);
            }
        });
        return Ok(client);
    }

    let connector = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| SyncError::Config(format!("Failed to build TLS connector: {}", e)))?;
    let tls = postgres_native_tls::MakeTlsConnector::new(connector);
    let (client, connection) = config.connect(tls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Source connection error: {}", e);
        }
    });
    Ok(client)
}

#[async_trait]
impl SourceQueryExecutor for PostgresSource {
    async fn query(&self, sql: &str) -> SyncResult<Table> {
        let client = self.client().await?;
        let statement = client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = client.query(&statement, &[]).await?;

        let mut table = Table::new(columns);
        for row in &rows {
            table.push_row(row_to_json(row)?)?;
        }
        tracing::debug!("Source query returned {} rows", table.num_rows());
        Ok(table)
    }
}

/// Convert every column of a row to a JSON cell.
pub fn row_to_json(row: &Row) -> SyncResult<Vec<Value>> {
    (0..row.len()).map(|idx| column_to_json(row, idx)).collect()
}

fn column_to_json(row: &Row, idx: usize) -> SyncResult<Value> {
    let column = &row.columns()[idx];
    let type_name = column.type_().name();

    let value = match type_name {
        "bool" => get::<bool>(row, idx)?.map(Value::from),
        "int2" => get::<i16>(row, idx)?.map(Value::from),
        "int4" => get::<i32>(row, idx)?.map(Value::from),
        "int8" => get::<i64>(row, idx)?.map(Value::from),
        "oid" => get::<u32>(row, idx)?.map(Value::from),
        "float4" => get::<f32>(row, idx)?.map(|f| float_to_json(f as f64)),
        "float8" => get::<f64>(row, idx)?.map(float_to_json),
        // Exact decimal text; JSON numbers would lose precision
        "numeric" => get::<rust_decimal::Decimal>(row, idx)?.map(|d| Value::String(d.to_string())),
        "text" | "varchar" | "bpchar" | "name" | "citext" => {
            get::<String>(row, idx)?.map(Value::String)
        }
        "uuid" => get::<uuid::Uuid>(row, idx)?.map(|u| Value::String(u.to_string())),
        "timestamp" => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|ts| Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "timestamptz" => get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(|ts| {
            Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
        }),
        "date" => get::<chrono::NaiveDate>(row, idx)?.map(|d| Value::String(d.to_string())),
        "json" | "jsonb" => get::<Value>(row, idx)?,
        "bytea" => get::<Vec<u8>>(row, idx)?
            .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b))),
        other => {
            return Err(SyncError::Schema(format!(
                "column '{}' has unsupported type '{}'",
                column.name(),
                other
            )))
        }
    };

    Ok(value.unwrap_or(Value::Null))
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> SyncResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        SyncError::Schema(format!(
            "failed to decode column '{}': {}",
            row.columns()[idx].name(),
            e
        ))
    })
}

/// JSON has no NaN or Infinity; those are kept as strings.
fn float_to_json(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_json() {
        assert_eq!(float_to_json(1.5), serde_json::json!(1.5));
        assert_eq!(float_to_json(f64::NAN), Value::String("NaN".to_string()));
        assert_eq!(float_to_json(f64::INFINITY), Value::String("inf".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let result = PostgresSource::connect("not a url at all ===", RetryPolicy::no_retry()).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
