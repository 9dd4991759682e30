//! On-disk persistence for observer state, so a restarted observer picks
//! up where it left off.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ClientEntry;
use crate::error::{Error, Result};

const CACHE_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<ClientEntry>,
}

/// JSON cache file. Writes go to a sibling temp file that is renamed over
/// the target, so a crash mid-write never leaves a truncated cache.
#[derive(Debug, Clone)]
pub struct ClientCache {
    path: PathBuf,
}

impl ClientCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted entries. A missing file is an empty cache.
    pub async fn load(&self) -> Result<Vec<ClientEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: CacheFile = serde_json::from_slice(&bytes)?;
        if file.version != CACHE_VERSION {
            return Err(Error::Other(format!(
                "unsupported cache version {} in {}",
                file.version,
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), entries = file.entries.len(), "observer cache loaded");
        Ok(file.entries)
    }

    pub async fn save(&self, entries: &[ClientEntry], now: DateTime<Utc>) -> Result<()> {
        let file = CacheFile {
            version: CACHE_VERSION,
            saved_at: now,
            entries: entries.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "observer-cache".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;

    fn entry(id: &str) -> ClientEntry {
        ClientEntry {
            entity_id: id.to_string(),
            alternate_id: None,
            status: JobStatus::Active,
            progress: 12,
            stage: Some("transcribe".into()),
            error: None,
            last_updated: Some(Utc::now()),
            touched_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClientCache::new(dir.path().join("absent.json"));
        assert!(cache.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ClientCache::new(dir.path().join("nested/state.json"));
        cache.save(&[entry("a"), entry("b")], Utc::now()).await.unwrap();
        cache.save(&[entry("c")], Utc::now()).await.unwrap();

        let loaded = cache.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].entity_id, "c");
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(ClientCache::new(path).load().await.is_err());
    }
}
