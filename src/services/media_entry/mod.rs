//! Media entries: catalogue media, AniDB records and local files merged into
//! one episode list with a watch and download plan.

pub mod download_info;
pub mod episode;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::services::anilist::{AnimeCollection, Catalogue, ListEntry, ListStatus, Media};
use crate::services::anizip::{AniDbRecord, Discrepancy, EpisodeDb, Platform};
use crate::services::cache::ResultCache;
use crate::services::local_file::{LocalFile, LocalFileKind};

pub use download_info::{EntryDownloadEpisode, EntryDownloadInfo};
pub use episode::{EntryEpisodeMetadata, MediaEntryEpisode, MetadataIssue};

/// AniDB records are refreshed after this long
const RECORD_TTL: Duration = Duration::from_secs(10 * 60);

/// The user's list state for an entry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryListData {
    pub progress: i32,
    pub score: f64,
    pub status: Option<ListStatus>,
    pub repeat: i32,
}

impl From<&ListEntry> for EntryListData {
    fn from(entry: &ListEntry) -> Self {
        Self {
            progress: entry.progress(),
            score: entry.score.unwrap_or(0.0),
            status: entry.status.map(ListStatus::folded),
            repeat: entry.repeat.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntry {
    pub media_id: i32,
    pub media: Media,
    pub list_data: Option<EntryListData>,
    pub local_files: Vec<LocalFile>,
    pub episodes: Vec<MediaEntryEpisode>,
    pub next_episode: Option<MediaEntryEpisode>,
    pub download_info: Option<EntryDownloadInfo>,
    #[serde(rename = "aniDBId")]
    pub anidb_id: Option<i32>,
    pub current_episode_count: i32,
    pub has_watched_all: bool,
}

impl MediaEntry {
    /// Assemble an entry from already fetched parts. `files` may contain files
    /// of other media; only those matched to `media` are kept.
    pub fn assemble(
        media: Media,
        list_entry: Option<&ListEntry>,
        files: &[LocalFile],
        record: Option<&AniDbRecord>,
    ) -> Self {
        let local_files: Vec<LocalFile> = files
            .iter()
            .filter(|f| f.media_id == media.id && !f.ignored)
            .cloned()
            .collect();

        let list_data = list_entry.map(EntryListData::from);
        let progress = list_data.as_ref().map(|d| d.progress).unwrap_or(0);
        let current_episode_count = media.current_episode_count();

        let progress_offset = match record {
            Some(r) => progress_offset(r, &media, &local_files),
            None => 0,
        };

        let mut episodes: Vec<MediaEntryEpisode> = local_files
            .iter()
            .map(|f| MediaEntryEpisode::from_local_file(f, &media, record, progress_offset))
            .collect();

        let download_info = record.and_then(|r| {
            EntryDownloadInfo::new(
                &media,
                r,
                &local_files,
                progress,
                progress_offset,
                list_data.as_ref().and_then(|d| d.status),
            )
        });

        // Aired episodes that are neither watched nor on disk
        if let Some(info) = &download_info {
            for planned in &info.episodes_to_download {
                if planned.episode.is_main() && planned.episode.progress_number > progress {
                    episodes.push(planned.episode.clone());
                }
            }
        }

        episodes.sort_by_key(|e| (!e.is_main(), e.kind != LocalFileKind::Special, e.episode_number));

        let has_watched_all = current_episode_count > 0 && progress >= current_episode_count;
        let next_episode = if has_watched_all {
            None
        } else {
            episodes
                .iter()
                .filter(|e| e.is_main() && !e.is_invalid && e.progress_number > progress)
                .min_by_key(|e| e.progress_number)
                .cloned()
        };

        Self {
            media_id: media.id,
            anidb_id: record.and_then(|r| r.mappings.anidb_id),
            media,
            list_data,
            local_files,
            episodes,
            next_episode,
            download_info,
            current_episode_count,
            has_watched_all,
        }
    }

    pub fn main_episodes(&self) -> impl Iterator<Item = &MediaEntryEpisode> {
        self.episodes.iter().filter(|e| e.is_main())
    }

    pub fn find_episode_by_file(&self, path: &str) -> Option<&MediaEntryEpisode> {
        self.episodes
            .iter()
            .find(|e| e.local_file.as_ref().is_some_and(|f| f.has_path(path)))
    }
}

/// 1 when the catalogue's episode 0 is AniDB's `S1` and such a file is present
fn progress_offset(record: &AniDbRecord, media: &Media, files: &[LocalFile]) -> i32 {
    if record.discrepancy(media.current_episode_count()) != Discrepancy::CatalogueCountsEpisodeZero {
        return 0;
    }
    let has_zero = files
        .iter()
        .any(|f| f.metadata.kind == LocalFileKind::Main && f.metadata.episode == 0);
    i32::from(has_zero)
}

/// Builds [`MediaEntry`] values, fetching what the caller does not hold
pub struct MediaEntryBuilder {
    catalogue: Arc<dyn Catalogue>,
    episode_db: Arc<dyn EpisodeDb>,
    records: ResultCache<i32, AniDbRecord>,
}

impl MediaEntryBuilder {
    pub fn new(catalogue: Arc<dyn Catalogue>, episode_db: Arc<dyn EpisodeDb>) -> Self {
        Self {
            catalogue,
            episode_db,
            records: ResultCache::with_ttl(RECORD_TTL),
        }
    }

    pub async fn build(
        &self,
        media_id: i32,
        files: &[LocalFile],
        collection: &AnimeCollection,
    ) -> Result<MediaEntry> {
        let list_entry = collection.find_entry(media_id);
        let media = match list_entry {
            Some(entry) => entry.media.clone(),
            None => self
                .catalogue
                .media_by_id(media_id)
                .await
                .with_context(|| format!("Failed to fetch media {media_id}"))?,
        };

        let record = self.record(media_id).await;
        let entry = MediaEntry::assemble(media, list_entry, files, record.as_ref());
        debug!(
            media_id,
            files = entry.local_files.len(),
            episodes = entry.episodes.len(),
            "Media entry built"
        );
        Ok(entry)
    }

    async fn record(&self, media_id: i32) -> Option<AniDbRecord> {
        let db = self.episode_db.clone();
        match self
            .records
            .get_or_compute(media_id, move || async move {
                db.media(Platform::Anilist, media_id).await
            })
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(media_id, error = %e, "AniDB record unavailable for entry");
                None
            }
        }
    }
}
