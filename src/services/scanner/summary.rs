//! Per-file scan diagnostics
//!
//! The scanner records what happened to each file here, independent of the
//! tracing configuration. At the end of a scan the log is folded into a
//! [`ScanSummary`] grouped by media.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::anilist::AnimeCollection;
use crate::services::local_file::LocalFile;

use super::media_container::MediaContainer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Default)]
struct FileLog {
    logs: Vec<String>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

/// Thread-safe collector, shared by every scan phase
#[derive(Debug, Default)]
pub struct ScanSummaryLogger {
    files: Mutex<HashMap<String, FileLog>>,
}

impl ScanSummaryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, file: &LocalFile, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let mut files = self.files.lock();
        let entry = files.entry(file.normalized_path()).or_default();
        match level {
            LogLevel::Warning => entry.warnings.push(message),
            LogLevel::Error => entry.errors.push(message),
            LogLevel::Debug | LogLevel::Info => entry.logs.push(message),
        }
    }

    pub fn info(&self, file: &LocalFile, message: impl Into<String>) {
        self.log(file, LogLevel::Info, message);
    }

    pub fn warn(&self, file: &LocalFile, message: impl Into<String>) {
        self.log(file, LogLevel::Warning, message);
    }

    pub fn error(&self, file: &LocalFile, message: impl Into<String>) {
        self.log(file, LogLevel::Error, message);
    }

    pub fn matched(&self, file: &LocalFile, media_id: i32, title: &str, rating: f64) {
        self.info(
            file,
            format!("Matched to media {media_id} ({title}), rating {rating:.3}"),
        );
    }

    pub fn not_matched(&self, file: &LocalFile, reason: &str) {
        self.warn(file, format!("Not matched: {reason}"));
    }

    pub fn hydrated(&self, file: &LocalFile) {
        self.info(
            file,
            format!(
                "Hydrated as {} episode {} (AniDB \"{}\")",
                file.metadata.kind, file.metadata.episode, file.metadata.anidb_episode
            ),
        );
    }

    /// Fold the collected logs into a summary over the final file list
    pub fn generate(
        &self,
        files: &[LocalFile],
        container: &MediaContainer,
        collection: &AnimeCollection,
    ) -> ScanSummary {
        let mut logs = std::mem::take(&mut *self.files.lock());
        let mut groups: BTreeMap<i32, Vec<ScanSummaryFile>> = BTreeMap::new();
        let mut unmatched = Vec::new();

        for file in files {
            let log = logs.remove(&file.normalized_path()).unwrap_or_default();
            let entry = ScanSummaryFile::new(file, log);
            if file.is_matched() {
                groups.entry(file.media_id).or_default().push(entry);
            } else {
                unmatched.push(entry);
            }
        }

        let groups = groups
            .into_iter()
            .map(|(media_id, files)| {
                let media = container.get(media_id);
                ScanSummaryGroup {
                    media_id,
                    media_title: media.map(|m| m.preferred_title()).unwrap_or_default(),
                    media_image: media.and_then(|m| m.cover_image_url()).map(str::to_string),
                    media_is_in_collection: collection.contains(media_id),
                    files,
                }
            })
            .collect();

        ScanSummary {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            groups,
            unmatched_files: unmatched,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummaryFile {
    pub path: String,
    pub name: String,
    pub media_id: i32,
    pub episode: i32,
    pub anidb_episode: String,
    pub logs: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ScanSummaryFile {
    fn new(file: &LocalFile, log: FileLog) -> Self {
        Self {
            path: file.path.clone(),
            name: file.name.clone(),
            media_id: file.media_id,
            episode: file.metadata.episode,
            anidb_episode: file.metadata.anidb_episode.clone(),
            logs: log.logs,
            warnings: log.warnings,
            errors: log.errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummaryGroup {
    pub media_id: i32,
    pub media_title: String,
    pub media_image: Option<String>,
    pub media_is_in_collection: bool,
    pub files: Vec<ScanSummaryFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub groups: Vec<ScanSummaryGroup>,
    pub unmatched_files: Vec<ScanSummaryFile>,
}

impl ScanSummary {
    pub fn file(&self, path: &str) -> Option<&ScanSummaryFile> {
        self.groups
            .iter()
            .flat_map(|g| g.files.iter())
            .chain(self.unmatched_files.iter())
            .find(|f| f.path == path)
    }

    pub fn error_count(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.files.iter())
            .chain(self.unmatched_files.iter())
            .map(|f| f.errors.len())
            .sum()
    }
}
