// ABOUTME: Error taxonomy for the synchronization engine
// ABOUTME: Separates fatal, locally-recoverable and retryable failures

use thiserror::Error;

/// Result alias used throughout the library core.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Credential signing or renewal failed. Fatal for the cycle.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A table (target or watermark) does not exist yet.
    #[error("table not found: {0}")]
    NotFound(String),

    /// A required column is missing or a key/flag value is unusable.
    #[error("schema error: {0}")]
    Schema(String),

    /// Network failure or timeout that may succeed on retry.
    #[error("transient I/O failure: {0}")]
    Transient(String),

    /// Non-retryable failure reported by the table store.
    #[error("table store error: {0}")]
    Store(String),

    /// Non-retryable failure reported by the source database.
    #[error("source query failed: {0}")]
    Source(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => SyncError::NotFound(err.to_string()),
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::WouldBlock => SyncError::Transient(err.to_string()),
            _ => SyncError::Store(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Store(format!("malformed table document: {}", err))
    }
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        // A closed connection or a missing SQLSTATE means the failure happened below SQL
        if err.is_closed() || err.code().is_none() {
            SyncError::Transient(format!("{:#}", err))
        } else {
            SyncError::Source(format!("{:#}", err))
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return SyncError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) => SyncError::from_status(status, err.to_string()),
            None => SyncError::Store(err.to_string()),
        }
    }
}

impl SyncError {
    /// Classify an HTTP status returned by the remote store.
    pub fn from_status(status: reqwest::StatusCode, detail: String) -> Self {
        use reqwest::StatusCode;
        match status {
            StatusCode::NOT_FOUND => SyncError::NotFound(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(detail),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                SyncError::Transient(detail)
            }
            s if s.is_server_error() => SyncError::Transient(detail),
            _ => SyncError::Store(detail),
        }
    }
}
