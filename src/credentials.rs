// ABOUTME: CredentialBroker - issues short-lived delegated tokens for the table store
// ABOUTME: Signs account-SAS style tokens locally and renews them on expiry

use aws_lc_rs::hmac;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};

/// Default validity window of a freshly issued session.
pub const DEFAULT_SESSION_VALIDITY: Duration = Duration::from_secs(10 * 60);

const SAS_VERSION: &str = "2021-06-08";
const SAS_PERMISSIONS: &str = "rwdl";
const SAS_SERVICES: &str = "b";
const SAS_RESOURCE_TYPES: &str = "sco";
const SAS_PROTOCOL: &str = "https";

/// A delegated, time-boxed credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    token: String,
}

impl Session {
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The query-string token. Attach it to requests; never log it.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token", &"***")
            .finish()
    }
}

/// Holds the long-lived account secret and hands out short-lived sessions.
///
/// The held session is a guarded value: the expiry check and the regeneration
/// happen under one lock, so concurrent callers never both regenerate.
pub struct CredentialBroker {
    account_name: String,
    account_key: String,
    validity: Duration,
    session: Mutex<Option<Session>>,
    renewals: AtomicU64,
}

impl CredentialBroker {
    /// Create a broker for a storage account. `account_key` is the base64 account secret.
    pub fn new(account_name: impl Into<String>, account_key: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            account_key: account_key.into(),
            validity: DEFAULT_SESSION_VALIDITY,
            session: Mutex::new(None),
            renewals: AtomicU64::new(0),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Return a session that is valid right now, issuing a new one if needed.
    pub async fn ensure_session(&self) -> SyncResult<Session> {
        self.ensure_session_at(Utc::now()).await
    }

    /// Same as [`ensure_session`](Self::ensure_session) with an explicit clock reading.
    pub async fn ensure_session_at(&self, now: DateTime<Utc>) -> SyncResult<Session> {
        let mut held = self.session.lock().await;

        if let Some(session) = held.as_ref() {
            if session.is_valid_at(now) {
                return Ok(session.clone());
            }
            tracing::debug!(
                "Store session expired at {}, issuing a new one",
                session.expires_at
            );
        }

        let session = self.issue(now)?;
        self.renewals.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Issued store session for account {} valid until {}",
            self.account_name,
            session.expires_at
        );
        *held = Some(session.clone());
        Ok(session)
    }

    /// Number of sessions issued so far.
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    fn issue(&self, start: DateTime<Utc>) -> SyncResult<Session> {
        let validity = chrono::Duration::from_std(self.validity)
            .map_err(|e| SyncError::Auth(format!("invalid session validity: {}", e)))?;
        let expires_at = start + validity;
        let token = sign_account_sas(&self.account_name, &self.account_key, start, expires_at)?;
        Ok(Session {
            issued_at: start,
            expires_at,
            token,
        })
    }
}

impl fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("account_name", &self.account_name)
            .field("account_key", &"***")
            .field("validity", &self.validity)
            .finish()
    }
}

/// Build an account SAS token valid between `start` and `expiry`.
///
/// The string-to-sign is the newline-terminated field list of the account SAS
/// scheme, signed with HMAC-SHA256 keyed by the decoded account key.
pub fn sign_account_sas(
    account_name: &str,
    account_key: &str,
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
) -> SyncResult<String> {
    if account_name.trim().is_empty() {
        return Err(SyncError::Auth("account name is empty".to_string()));
    }
    if account_key.trim().is_empty() {
        return Err(SyncError::Auth("account key is empty".to_string()));
    }
    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(account_key.trim())
        .map_err(|e| SyncError::Auth(format!("account key is not valid base64: {}", e)))?;

    let signed_start = format_sas_time(start);
    let signed_expiry = format_sas_time(expiry);

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n\n{}\n{}\n",
        account_name,
        SAS_PERMISSIONS,
        SAS_SERVICES,
        SAS_RESOURCE_TYPES,
        signed_start,
        signed_expiry,
        SAS_PROTOCOL,
        SAS_VERSION
    );

    let key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
    let tag = hmac::sign(&key, string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(tag.as_ref());

    Ok(url::form_urlencoded::Serializer::new(String::new())
        .append_pair("sv", SAS_VERSION)
        .append_pair("ss", SAS_SERVICES)
        .append_pair("srt", SAS_RESOURCE_TYPES)
        .append_pair("sp", SAS_PERMISSIONS)
        .append_pair("st", &signed_start)
        .append_pair("se", &signed_expiry)
        .append_pair("spr", SAS_PROTOCOL)
        .append_pair("sig", &signature)
        .finish())
}

fn format_sas_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // base64("test-account-key")
    const KEY: &str = "dGVzdC1hY2NvdW50LWtleQ==";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_session_reused_while_valid() {
        let broker = CredentialBroker::new("acct", KEY);
        let first = broker.ensure_session_at(t0()).await.unwrap();
        let second = broker
            .ensure_session_at(t0() + chrono::Duration::minutes(9))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.renewals(), 1);
        assert_eq!(first.expires_at(), t0() + chrono::Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_session_renewed_at_expiry() {
        let broker = CredentialBroker::new("acct", KEY);
        let first = broker.ensure_session_at(t0()).await.unwrap();
        // Expiry exactly at "now" counts as expired
        let renewed = broker
            .ensure_session_at(first.expires_at())
            .await
            .unwrap();
        assert_ne!(first.token(), renewed.token());
        assert_eq!(renewed.issued_at(), first.expires_at());
        assert!(renewed.is_valid_at(first.expires_at()));
        assert_eq!(broker.renewals(), 2);
    }

    #[tokio::test]
    async fn test_custom_validity() {
        let broker = CredentialBroker::new("acct", KEY).with_validity(Duration::from_secs(30));
        let session = broker.ensure_session_at(t0()).await.unwrap();
        assert_eq!(session.expires_at(), t0() + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_malformed_secret_is_auth_error() {
        let broker = CredentialBroker::new("acct", "not base64 !!");
        let err = broker.ensure_session_at(t0()).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));

        let broker = CredentialBroker::new("acct", "");
        assert!(matches!(
            broker.ensure_session_at(t0()).await,
            Err(SyncError::Auth(_))
        ));
    }

    #[test]
    fn test_token_fields() {
        let token =
            sign_account_sas("acct", KEY, t0(), t0() + chrono::Duration::minutes(10)).unwrap();
        assert!(token.contains("sv=2021-06-08"));
        assert!(token.contains("sp=rwdl"));
        assert!(token.contains("srt=sco"));
        assert!(token.contains("se=2024-05-01T12%3A10%3A00Z"));
        assert!(token.contains("&sig="));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let expiry = t0() + chrono::Duration::minutes(10);
        let a = sign_account_sas("acct", KEY, t0(), expiry).unwrap();
        let b = sign_account_sas("acct", KEY, t0(), expiry).unwrap();
        let other_account = sign_account_sas("other", KEY, t0(), expiry).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, other_account);
    }

    #[tokio::test]
    async fn test_debug_redacts_secrets() {
        let broker = CredentialBroker::new("acct", KEY);
        let session = broker.ensure_session_at(t0()).await.unwrap();
        let rendered = format!("{:?} {:?}", broker, session);
        assert!(!rendered.contains(KEY));
        assert!(!rendered.contains(session.token()));
        assert!(rendered.contains("acct"));
    }
}
