//! Persistence of the project's files between sandboxes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project_id: String,
    pub saved_at: DateTime<Utc>,
    pub files: BTreeMap<String, String>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save(&self, project_id: &str, files: &BTreeMap<String, String>) -> Result<()>;

    /// The last saved snapshot, or `None` if the project was never saved.
    async fn load(&self, project_id: &str) -> Result<Option<ProjectSnapshot>>;
}

/// One pretty-printed JSON document per project under `dir`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a project is stored in. Characters outside `[A-Za-z0-9_-]` are
    /// replaced so an id can never escape `dir`.
    pub fn snapshot_path(&self, project_id: &str) -> PathBuf {
        let safe: String = project_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = if safe.is_empty() { "default".to_string() } else { safe };
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl ProjectStore for JsonFileStore {
    async fn save(&self, project_id: &str, files: &BTreeMap<String, String>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create store directory {}", self.dir.display()))?;

        let snapshot = ProjectSnapshot {
            project_id: project_id.to_string(),
            saved_at: Utc::now(),
            files: files.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialize project")?;

        let path = self.snapshot_path(project_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!(project_id, files = files.len(), path = %path.display(), "saved project");
        Ok(())
    }

    async fn load(&self, project_id: &str) -> Result<Option<ProjectSnapshot>> {
        let path = self.snapshot_path(project_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("projects"));
        let files: BTreeMap<String, String> =
            [("src/App.jsx".to_string(), "export default 1".to_string())]
                .into_iter()
                .collect();

        store.save("demo", &files).await.unwrap();
        let snapshot = store.load("demo").await.unwrap().unwrap();
        assert_eq!(snapshot.project_id, "demo");
        assert_eq!(snapshot.files, files);
        assert!(!dir.path().join("projects/demo.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_is_error() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        std::fs::write(store.snapshot_path("bad"), "{not json").unwrap();
        assert!(store.load("bad").await.is_err());
    }

    #[test]
    fn test_snapshot_path_stays_in_dir() {
        let store = JsonFileStore::new("/tmp/store");
        assert_eq!(
            store.snapshot_path("../../etc/passwd"),
            PathBuf::from("/tmp/store/______etc_passwd.json")
        );
        assert_eq!(store.snapshot_path(""), PathBuf::from("/tmp/store/default.json"));
    }
}
