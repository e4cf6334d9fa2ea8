// ABOUTME: FsTableStore - versioned tables in a hierarchical filesystem namespace
// ABOUTME: Each write lands atomically as a new numbered JSON snapshot

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::{TableDocument, TableStoreClient, WriteMode};
use crate::error::{SyncError, SyncResult};
use crate::table::{Table, TargetTableRef};

const VERSIONS_DIR: &str = "_versions";
const TEMP_SUFFIX: &str = ".tmp";

/// Table store rooted at a local or mounted directory.
///
/// Layout: `<root>/<container>/<table_path>/_versions/<version>.json`. Readers always
/// see the highest version; writers publish version N+1 by renaming a fully written
/// temp file into place, so a crashed write never leaves a partial table behind.
#[derive(Debug, Clone)]
pub struct FsTableStore {
    root: PathBuf,
    retained_versions: Option<usize>,
}

impl FsTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retained_versions: None,
        }
    }

    /// Keep at most `count` snapshots per table, pruning older ones after each write.
    pub fn with_retained_versions(mut self, count: usize) -> Self {
        self.retained_versions = Some(count.max(1));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the snapshots of a table.
    pub fn versions_dir(&self, table: &TargetTableRef) -> SyncResult<PathBuf> {
        let mut dir = self.root.clone();
        push_checked(&mut dir, table.container())?;
        for segment in table.table_path().split('/') {
            push_checked(&mut dir, segment)?;
        }
        dir.push(VERSIONS_DIR);
        Ok(dir)
    }

    /// All published versions of a table, ascending.
    pub async fn list_versions(&self, table: &TargetTableRef) -> SyncResult<Vec<u64>> {
        let dir = self.versions_dir(table)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(version) = name
                .strip_suffix(".json")
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn latest_version(&self, table: &TargetTableRef) -> SyncResult<Option<u64>> {
        Ok(self.list_versions(table).await?.last().copied())
    }

    async fn read_version(&self, table: &TargetTableRef, version: u64) -> SyncResult<Table> {
        let path = self.versions_dir(table)?.join(version_file_name(version));
        let contents = fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SyncError::NotFound(table.to_string()),
            _ => SyncError::from(e),
        })?;
        let document: TableDocument = serde_json::from_slice(&contents)?;
        Ok(document.table)
    }

    /// Drop old snapshots and temp files left by interrupted writes.
    ///
    /// Assumes writes to one table are serialized, so no temp file here belongs
    /// to a write still in flight.
    async fn prune(&self, table: &TargetTableRef, keep: usize) -> SyncResult<()> {
        let dir = self.versions_dir(table)?;
        remove_temp_files(&dir).await?;

        let versions = self.list_versions(table).await?;
        if versions.len() <= keep {
            return Ok(());
        }
        for version in &versions[..versions.len() - keep] {
            if let Err(e) = fs::remove_file(dir.join(version_file_name(*version))).await {
                tracing::warn!("Failed to prune version {} of {}: {}", version, table, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TableStoreClient for FsTableStore {
    async fn exists(&self, table: &TargetTableRef) -> SyncResult<bool> {
        Ok(self.latest_version(table).await?.is_some())
    }

    async fn read_table(&self, table: &TargetTableRef) -> SyncResult<Table> {
        match self.latest_version(table).await? {
            Some(version) => self.read_version(table, version).await,
            None => Err(SyncError::NotFound(table.to_string())),
        }
    }

    async fn write_table(
        &self,
        table: &TargetTableRef,
        data: &Table,
        mode: WriteMode,
    ) -> SyncResult<()> {
        let dir = self.versions_dir(table)?;
        fs::create_dir_all(&dir).await?;

        let latest = self.latest_version(table).await?;
        let content = match (mode, latest) {
            (WriteMode::Append, Some(version)) => {
                let mut existing = self.read_version(table, version).await?;
                existing.append(data.clone())?;
                existing
            }
            _ => data.clone(),
        };

        let next = latest.map_or(1, |v| v + 1);
        let encoded = serde_json::to_vec(&TableDocument::new(content))?;

        let tmp_path = dir.join(format!(".{}{}", uuid::Uuid::new_v4(), TEMP_SUFFIX));
        let final_path = dir.join(version_file_name(next));
        let published = match fs::write(&tmp_path, &encoded).await {
            Ok(()) => fs::rename(&tmp_path, &final_path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tracing::debug!("Published version {} of {} ({:?})", next, table, mode);

        if let Some(keep) = self.retained_versions {
            self.prune(table, keep).await?;
        }
        Ok(())
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

async fn remove_temp_files(dir: &Path) -> SyncResult<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_str().is_some_and(is_temp_file) {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => tracing::debug!("Removed leftover temp file {}", entry.path().display()),
            Err(e) => tracing::warn!("Failed to remove temp file {}: {}", entry.path().display(), e),
        }
    }
    Ok(())
}

fn version_file_name(version: u64) -> String {
    format!("{:020}.json", version)
}

/// Append one namespace segment, refusing anything that could escape the root.
fn push_checked(path: &mut PathBuf, segment: &str) -> SyncResult<()> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part != VERSIONS_DIR => {
            path.push(part);
            Ok(())
        }
        _ => Err(SyncError::Config(format!(
            "invalid table namespace segment '{}'",
            segment
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_names() {
        assert!(is_temp_file(".5f1c2d.tmp"));
        assert!(!is_temp_file("00000000000000000001.json"));
        assert!(!is_temp_file("notes.tmp"));
    }

    #[test]
    fn test_versions_dir_layout() {
        let store = FsTableStore::new("/lake");
        let dir = store
            .versions_dir(&TargetTableRef::new("source-data", "source_data/table1"))
            .unwrap();
        assert_eq!(
            dir,
            PathBuf::from("/lake/source-data/source_data/table1/_versions")
        );
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let store = FsTableStore::new("/lake");
        assert!(store
            .versions_dir(&TargetTableRef::new("data", "../etc/passwd"))
            .is_err());
        assert!(store.versions_dir(&TargetTableRef::new("..", "t")).is_err());
        assert!(store.versions_dir(&TargetTableRef::new("data", "a//b")).is_err());
        assert!(store
            .versions_dir(&TargetTableRef::new("data", "t/_versions"))
            .is_err());
    }

    #[test]
    fn test_version_file_name_sorts_lexically() {
        assert!(version_file_name(9) < version_file_name(10));
        assert_eq!(version_file_name(1), "00000000000000000001.json");
    }
}
