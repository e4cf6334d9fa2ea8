// ABOUTME: TOML configuration for lake-replicator - source, store, retry bounds and load lists
// ABOUTME: Validates identifiers up front and builds the store and plan the orchestrator runs

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CredentialBroker;
use crate::source::ChangeFeedQuery;
use crate::store::{FsTableStore, HttpTableStore, TableStoreClient};
use crate::sync::watermark::{self, WatermarkStore};
use crate::sync::{FullLoadMode, FullLoadSpec, IncrementalSpec, SyncPlan};
use crate::table::TargetTableRef;
use crate::utils::{validate_identifier, RetryPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "lake-replicator.toml";
pub const SOURCE_URL_ENV: &str = "LAKE_SOURCE_URL";
pub const ACCOUNT_KEY_ENV: &str = "LAKE_ACCOUNT_KEY";

const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub source: SourceConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub watermarks: WatermarkConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub full_load: Vec<FullLoadConfig>,
    #[serde(default)]
    pub incremental: Vec<IncrementalConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// PostgreSQL connection URL. `LAKE_SOURCE_URL` takes precedence.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Filesystem,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Filesystem root, one directory per container
    pub root: Option<PathBuf>,
    /// Snapshots kept per table by the filesystem store; all when unset
    pub retained_versions: Option<usize>,
    pub endpoint: Option<String>,
    pub account_name: Option<String>,
    /// Prefer `LAKE_ACCOUNT_KEY`; a key in the file is used only when that is unset.
    pub account_key: Option<String>,
    #[serde(default = "default_session_validity_secs")]
    pub session_validity_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatermarkConfig {
    #[serde(default = "default_watermark_container")]
    pub container: String,
    #[serde(default = "default_watermark_path")]
    pub path: String,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            container: default_watermark_container(),
            path: default_watermark_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_max_concurrent_tables")]
    pub max_concurrent_tables: usize,
    /// Seconds between cycles in watch mode
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tables: default_max_concurrent_tables(),
            interval_secs: default_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FullLoadConfig {
    pub source_table: String,
    pub container: String,
    pub target_path: String,
    #[serde(default = "default_full_load_mode")]
    pub mode: FullLoadMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncrementalConfig {
    pub source_table: String,
    pub container: String,
    pub target_path: String,
    pub changes_table: String,
    pub change_created_column: String,
    pub primary_key: String,
    pub deleted_column: String,
}

fn default_session_validity_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_watermark_container() -> String {
    watermark::DEFAULT_CONTAINER.to_string()
}

fn default_watermark_path() -> String {
    watermark::DEFAULT_PATH.to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_tables() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_full_load_mode() -> FullLoadMode {
    FullLoadMode::Overwrite
}

impl ReplicatorConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.store.kind {
            StoreKind::Filesystem => {
                if self.store.root.is_none() {
                    bail!("store.root is required for the filesystem store");
                }
            }
            StoreKind::Http => {
                if self.store.endpoint.as_deref().map_or(true, str::is_empty) {
                    bail!("store.endpoint is required for the http store");
                }
                if self.store.account_name.as_deref().map_or(true, str::is_empty) {
                    bail!("store.account_name is required for the http store");
                }
                if self.account_key().is_none() {
                    bail!(
                        "account key is required for the http store (set {} or store.account_key)",
                        ACCOUNT_KEY_ENV
                    );
                }
            }
        }
        if self.store.session_validity_secs == 0 || self.store.request_timeout_secs == 0 {
            bail!("store.session_validity_secs and store.request_timeout_secs must be greater than 0");
        }

        require_path("watermarks.container", &self.watermarks.container)?;
        require_path("watermarks.path", &self.watermarks.path)?;

        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            bail!(
                "retry.max_retries must be at most {}, got {}",
                MAX_RETRIES_LIMIT,
                self.retry.max_retries
            );
        }
        if self.retry.initial_delay_ms == 0 || self.retry.operation_timeout_secs == 0 {
            bail!("retry.initial_delay_ms and retry.operation_timeout_secs must be greater than 0");
        }
        if self.sync.max_concurrent_tables == 0 {
            bail!("sync.max_concurrent_tables must be greater than 0");
        }
        if self.sync.interval_secs == 0 {
            bail!("sync.interval_secs must be greater than 0");
        }

        for load in &self.full_load {
            validate_identifier(&load.source_table)
                .with_context(|| format!("full_load '{}'", load.target_path))?;
            require_path("full_load.container", &load.container)?;
            require_path("full_load.target_path", &load.target_path)?;
        }

        let mut incremental_paths = HashSet::new();
        for load in &self.incremental {
            let context = || format!("incremental '{}'", load.target_path);
            require_path("incremental.container", &load.container)?;
            require_path("incremental.target_path", &load.target_path)?;
            for identifier in [
                &load.source_table,
                &load.changes_table,
                &load.change_created_column,
                &load.primary_key,
                &load.deleted_column,
            ] {
                validate_identifier(identifier).with_context(context)?;
            }
            // Watermarks are keyed by target path alone
            if !incremental_paths.insert(load.target_path.trim_matches('/')) {
                bail!(
                    "target_path '{}' is configured for more than one incremental load",
                    load.target_path
                );
            }
        }

        Ok(())
    }

    /// `LAKE_SOURCE_URL`, else `source.url`.
    pub fn source_url(&self) -> Result<String> {
        std::env::var(SOURCE_URL_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .or_else(|| self.source.url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Source database URL not provided. Set {} or source.url",
                    SOURCE_URL_ENV
                )
            })
    }

    fn account_key(&self) -> Option<String> {
        std::env::var(ACCOUNT_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.store.account_key.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            operation_timeout: Duration::from_secs(self.retry.operation_timeout_secs),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn watermark_location(&self) -> TargetTableRef {
        TargetTableRef::new(self.watermarks.container.clone(), &self.watermarks.path)
    }

    /// Every configured load as one plan.
    pub fn plan(&self) -> SyncPlan {
        let full_loads = self
            .full_load
            .iter()
            .map(|load| FullLoadSpec {
                source_table: load.source_table.clone(),
                target: TargetTableRef::new(load.container.clone(), &load.target_path),
                mode: load.mode,
            })
            .collect();

        let incremental = self
            .incremental
            .iter()
            .map(|load| {
                IncrementalSpec::new(
                    load.source_table.clone(),
                    TargetTableRef::new(load.container.clone(), &load.target_path),
                    ChangeFeedQuery::new(load.changes_table.clone(), load.change_created_column.clone()),
                    load.primary_key.clone(),
                    load.deleted_column.clone(),
                )
            })
            .collect();

        SyncPlan {
            full_loads,
            incremental,
            max_concurrent_tables: self.sync.max_concurrent_tables,
        }
    }

    /// The configured table store.
    pub fn build_store(&self) -> Result<Arc<dyn TableStoreClient>> {
        match self.store.kind {
            StoreKind::Filesystem => {
                let root = self
                    .store
                    .root
                    .clone()
                    .context("store.root is required for the filesystem store")?;
                let mut store = FsTableStore::new(root);
                if let Some(keep) = self.store.retained_versions {
                    store = store.with_retained_versions(keep);
                }
                tracing::info!("Using filesystem table store at {}", store.root().display());
                Ok(Arc::new(store))
            }
            StoreKind::Http => {
                let endpoint = self
                    .store
                    .endpoint
                    .as_deref()
                    .context("store.endpoint is required for the http store")?;
                let account_name = self
                    .store
                    .account_name
                    .clone()
                    .context("store.account_name is required for the http store")?;
                let account_key = self
                    .account_key()
                    .with_context(|| format!("{} is not set", ACCOUNT_KEY_ENV))?;

                let broker = CredentialBroker::new(account_name, account_key)
                    .with_validity(Duration::from_secs(self.store.session_validity_secs));
                let store = HttpTableStore::new(
                    endpoint,
                    Arc::new(broker),
                    Duration::from_secs(self.store.request_timeout_secs),
                )?;
                tracing::info!("Using HTTP table store at {}", endpoint);
                Ok(Arc::new(store))
            }
        }
    }

    pub fn watermark_store(&self, store: Arc<dyn TableStoreClient>) -> WatermarkStore {
        WatermarkStore::new(store, self.watermark_location(), self.retry_policy())
    }
}

fn require_path(field: &str, value: &str) -> Result<()> {
    if value.trim().trim_matches('/').is_empty() {
        bail!("{} cannot be empty", field);
    }
    Ok(())
}
