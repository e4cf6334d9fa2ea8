// ABOUTME: Utility functions for identifier validation, quoting and retries
// ABOUTME: Provides timeout-bounded exponential backoff for transient failures

use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Bounds for retrying remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every subsequent retry
    pub initial_delay: Duration,
    /// Upper bound for a single attempt
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries. Handy for tests.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Run a future with the policy's per-attempt timeout.
///
/// An elapsed timeout is reported as a transient failure.
pub async fn with_timeout<Fut, T>(timeout: Duration, what: &str, fut: Fut) -> SyncResult<T>
where
    Fut: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Transient(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}

/// Retry an idempotent operation with exponential backoff.
///
/// Only transient failures are retried; anything else is returned immediately.
/// Each attempt is bounded by `policy.operation_timeout`. Callers must only pass
/// operations that are safe to repeat (reads); writes go through
/// [`write_with_verification`].
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: &RetryPolicy,
    what: &str,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        match with_timeout(policy.operation_timeout, what, operation()).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}...",
                    what,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2; // Exponential backoff
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Perform a non-idempotent write, re-verifying before any retry.
///
/// After a transient failure the write may or may not have landed. `verify` reads
/// the current state back and reports whether it already matches the intended
/// one; only if it does not is the write attempted again.
pub async fn write_with_verification<W, WFut, V, VFut>(
    mut write: W,
    mut verify: V,
    policy: &RetryPolicy,
    what: &str,
) -> SyncResult<()>
where
    W: FnMut() -> WFut,
    WFut: Future<Output = SyncResult<()>>,
    V: FnMut() -> VFut,
    VFut: Future<Output = SyncResult<bool>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        let err = match with_timeout(policy.operation_timeout, what, write()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        tokio::time::sleep(delay).await;
        delay *= 2;

        match retry_with_backoff(&mut verify, policy, what).await {
            Ok(true) => {
                tracing::info!("{} landed despite a transient error: {}", what, err);
                return Ok(());
            }
            Ok(false) => {}
            Err(verify_err) if verify_err.is_not_found() => {}
            Err(verify_err) => {
                tracing::warn!("Could not verify {}: {}", what, verify_err);
                return Err(err);
            }
        }

        if attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        tracing::warn!(
            "{} did not land (attempt {}/{}): {}, writing again",
            what,
            attempt,
            policy.max_retries + 1,
            err
        );
    }
}

/// Validate a (possibly dotted) SQL object name such as `db.schema.table`.
///
/// Each part must start with a letter or underscore and contain only letters,
/// digits and underscores. Names are interpolated into change-feed queries, so
/// anything else is rejected.
pub fn validate_identifier(identifier: &str) -> SyncResult<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config(
            "Identifier cannot be empty or whitespace-only".to_string(),
        ));
    }

    for part in trimmed.split('.') {
        let mut chars = part.chars();
        let first = chars.next().ok_or_else(|| {
            SyncError::Config(format!(
                "Identifier '{}' contains an empty name part",
                sanitize_identifier(trimmed)
            ))
        })?;
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(SyncError::Config(format!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first
            )));
        }
        if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
            return Err(SyncError::Config(format!(
                "Identifier '{}' contains invalid character '{}'. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if bad.is_control() {
                    format!("\\x{:02x}", bad as u32)
                } else {
                    bad.to_string()
                }
            )));
        }
    }

    Ok(())
}

/// Sanitize an identifier for display: strips control characters, caps length.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a single SQL identifier, escaping embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote every part of a dotted object name: `db.fact.t` -> `"db"."fact"."t"`.
pub fn quote_qualified_name(name: &str) -> String {
    name.trim()
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Quote a SQL string literal by doubling single quotes.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Mask the password in a connection URL for logging.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}
