//! JSON-file store for local files and scan summaries
//!
//! Layout under the data directory:
//! - `local_files.json` - every `LocalFile` from the last scan
//! - `summaries/{millis}-{id}.json` - one file per scan summary

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, info, warn};

use super::local_file::{LocalFile, normalize_path};

const LOCAL_FILES: &str = "local_files.json";
const SUMMARIES_DIR: &str = "summaries";

/// Pruning starts above this many summaries
const MAX_SUMMARIES: usize = 10;
/// How many summaries survive a prune
const KEEP_SUMMARIES: usize = 5;

pub struct LibraryStore {
    data_path: PathBuf,
    files: RwLock<Vec<LocalFile>>,
}

impl LibraryStore {
    /// Open the store, loading any persisted local files
    pub async fn open(data_path: impl Into<PathBuf>) -> Result<Self> {
        let data_path = data_path.into();
        fs::create_dir_all(data_path.join(SUMMARIES_DIR))
            .await
            .with_context(|| format!("Failed to create data directory {}", data_path.display()))?;

        let files_path = data_path.join(LOCAL_FILES);
        let files: Vec<LocalFile> = if fs::try_exists(&files_path).await.unwrap_or(false) {
            read_json(&files_path).await.unwrap_or_else(|e| {
                warn!(path = %files_path.display(), error = %e, "Ignoring unreadable local file store");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        info!(path = %data_path.display(), count = files.len(), "Library store opened");
        Ok(Self {
            data_path,
            files: RwLock::new(files),
        })
    }

    pub fn local_files(&self) -> Vec<LocalFile> {
        self.files.read().clone()
    }

    /// Replace every local file and persist
    pub async fn save_local_files(&self, files: Vec<LocalFile>) -> Result<()> {
        write_json(&self.data_path.join(LOCAL_FILES), &files).await?;
        debug!(count = files.len(), "Local files saved");
        *self.files.write() = files;
        Ok(())
    }

    /// Apply `update` to the file at `path` and persist. Returns false when
    /// no file has that path.
    pub async fn update_local_file<F>(&self, path: &str, update: F) -> Result<bool>
    where
        F: FnOnce(&mut LocalFile) + Send,
    {
        let files = {
            let mut files = self.files.write();
            let Some(file) = files.iter_mut().find(|f| f.has_path(path)) else {
                return Ok(false);
            };
            update(file);
            files.clone()
        };
        write_json(&self.data_path.join(LOCAL_FILES), &files).await?;
        Ok(true)
    }

    /// Look a file up by path, falling back to the bare filename
    pub fn find(&self, path: &str) -> Option<LocalFile> {
        let normalized = normalize_path(path);
        let files = self.files.read();
        if let Some(file) = files.iter().find(|f| f.normalized_path() == normalized) {
            return Some(file.clone());
        }
        let name = normalized.rsplit('/').next().unwrap_or(&normalized);
        files
            .iter()
            .find(|f| f.name.to_lowercase() == name)
            .cloned()
    }

    pub fn files_for_media(&self, media_id: i32) -> Vec<LocalFile> {
        self.files
            .read()
            .iter()
            .filter(|f| f.media_id == media_id)
            .cloned()
            .collect()
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.data_path.join(SUMMARIES_DIR)
    }

    /// Persist a scan summary and prune old ones
    pub async fn save_summary<T: Serialize>(&self, id: &str, summary: &T) -> Result<PathBuf> {
        let millis = chrono::Utc::now().timestamp_millis();
        let path = self.summaries_dir().join(format!("{millis:013}-{id}.json"));
        write_json(&path, summary).await?;
        self.prune_summaries().await?;
        Ok(path)
    }

    /// Summary files, oldest first
    pub async fn summary_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(self.summaries_dir())
            .await
            .context("Failed to read summaries directory")?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn latest_summary<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.summary_files().await?.last() {
            Some(path) => Ok(Some(read_json(path).await?)),
            None => Ok(None),
        }
    }

    async fn prune_summaries(&self) -> Result<()> {
        let paths = self.summary_files().await?;
        if paths.len() <= MAX_SUMMARIES {
            return Ok(());
        }
        let excess = paths.len() - KEEP_SUMMARIES;
        for path in paths.iter().take(excess) {
            if let Err(e) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old scan summary");
            }
        }
        debug!(deleted = excess, "Pruned scan summaries");
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write through a temp file so readers never see a partial document
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_file(path: &str, media_id: i32) -> LocalFile {
        let mut lf = LocalFile::new(Path::new(path), Path::new("/lib"));
        lf.media_id = media_id;
        lf
    }

    #[tokio::test]
    async fn test_local_files_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let store = LibraryStore::open(dir.path()).await.unwrap();
        store
            .save_local_files(vec![local_file("/lib/Show/Show - 01.mkv", 7)])
            .await
            .unwrap();

        let reopened = LibraryStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.local_files().len(), 1);
        assert_eq!(reopened.files_for_media(7).len(), 1);
    }

    #[tokio::test]
    async fn test_find_falls_back_to_filename() {
        let dir = TempDir::new().unwrap();
        let store = LibraryStore::open(dir.path()).await.unwrap();
        store
            .save_local_files(vec![local_file("/lib/Show/Show - 01.mkv", 7)])
            .await
            .unwrap();

        assert!(store.find("/LIB/show/show - 01.mkv").is_some());
        assert!(store.find(r"D:\elsewhere\Show - 01.mkv").is_some());
        assert!(store.find("/lib/Show/Show - 02.mkv").is_none());
    }

    #[tokio::test]
    async fn test_update_local_file_persists() {
        let dir = TempDir::new().unwrap();
        let store = LibraryStore::open(dir.path()).await.unwrap();
        store
            .save_local_files(vec![local_file("/lib/a - 01.mkv", 1)])
            .await
            .unwrap();

        let found = store
            .update_local_file("/lib/a - 01.mkv", |f| f.locked = true)
            .await
            .unwrap();
        assert!(found);

        let reopened = LibraryStore::open(dir.path()).await.unwrap();
        assert!(reopened.local_files()[0].locked);
    }

    #[tokio::test]
    async fn test_summaries_pruned_down_to_five() {
        let dir = TempDir::new().unwrap();
        let store = LibraryStore::open(dir.path()).await.unwrap();

        for i in 0..11 {
            store
                .save_summary(&format!("scan{i:02}"), &serde_json::json!({ "n": i }))
                .await
                .unwrap();
        }

        let files = store.summary_files().await.unwrap();
        assert_eq!(files.len(), KEEP_SUMMARIES);
        let latest: serde_json::Value = store.latest_summary().await.unwrap().unwrap();
        assert_eq!(latest["n"], 10);
    }
}
