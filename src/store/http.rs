// ABOUTME: HttpTableStore - whole-table reads and writes against a remote lake endpoint
// ABOUTME: Every request is authorized with a fresh session from the CredentialBroker

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{TableDocument, TableStoreClient, WriteMode};
use crate::credentials::CredentialBroker;
use crate::error::{SyncError, SyncResult};
use crate::table::{Table, TargetTableRef};

const DOCUMENT_NAME: &str = "_table.json";

/// Remote table store reached over HTTPS.
///
/// A table is one JSON document at `<endpoint>/<container>/<table_path>/_table.json`.
/// The session token travels only in the request URL's query string.
pub struct HttpTableStore {
    client: Client,
    endpoint: Url,
    broker: Arc<CredentialBroker>,
}

impl HttpTableStore {
    pub fn new(
        endpoint: &str,
        broker: Arc<CredentialBroker>,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| SyncError::Config(format!("invalid store endpoint '{}': {}", endpoint, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "store endpoint '{}' cannot be used as a base URL",
                endpoint
            )));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            broker,
        })
    }

    /// URL of a table document, without credentials.
    pub fn document_url(&self, table: &TargetTableRef) -> SyncResult<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                SyncError::Config(format!("store endpoint '{}' has no path", self.endpoint))
            })?;
            segments.pop_if_empty();
            segments.push(table.container());
            for segment in table.table_path().split('/') {
                segments.push(segment);
            }
            segments.push(DOCUMENT_NAME);
        }
        Ok(url)
    }

    async fn authorized_url(&self, table: &TargetTableRef) -> SyncResult<Url> {
        let session = self.broker.ensure_session().await?;
        let mut url = self.document_url(table)?;
        url.set_query(Some(session.token()));
        Ok(url)
    }

    async fn fetch(&self, table: &TargetTableRef) -> SyncResult<Option<Table>> {
        let url = self.authorized_url(table).await?;
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, table).await?;
        let document: TableDocument = response.json().await?;
        Ok(Some(document.table))
    }
}

#[async_trait]
impl TableStoreClient for HttpTableStore {
    async fn exists(&self, table: &TargetTableRef) -> SyncResult<bool> {
        let url = self.authorized_url(table).await?;
        let response = self.client.head(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SyncError::from_status(
                status,
                format!("existence check for {} returned {}", table, status),
            )),
        }
    }

    async fn read_table(&self, table: &TargetTableRef) -> SyncResult<Table> {
        self.fetch(table)
            .await?
            .ok_or_else(|| SyncError::NotFound(table.to_string()))
    }

    async fn write_table(
        &self,
        table: &TargetTableRef,
        data: &Table,
        mode: WriteMode,
    ) -> SyncResult<()> {
        let content = match mode {
            WriteMode::Overwrite => data.clone(),
            WriteMode::Append => match self.fetch(table).await? {
                Some(mut existing) => {
                    existing.append(data.clone())?;
                    existing
                }
                None => data.clone(),
            },
        };

        let url = self.authorized_url(table).await?;
        let response = self
            .client
            .put(url)
            .json(&TableDocument::new(content))
            .send()
            .await?;
        check_status(response, table).await?;

        tracing::debug!("Wrote {} ({:?})", table, mode);
        Ok(())
    }
}

async fn check_status(
    response: reqwest::Response,
    table: &TargetTableRef,
) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::from_status(
        status,
        format!("{} returned {}: {}", table, status, body),
    ))
}
