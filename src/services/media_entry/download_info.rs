//! Which episodes of a media still need downloading

use serde::Serialize;

use crate::services::anilist::{ListStatus, Media, MediaStatus};
use crate::services::anizip::{AniDbRecord, Discrepancy};
use crate::services::local_file::{LocalFile, LocalFileKind};

use super::episode::MediaEntryEpisode;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDownloadEpisode {
    pub episode_number: i32,
    #[serde(rename = "aniDBEpisode")]
    pub anidb_episode: String,
    pub episode: MediaEntryEpisode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDownloadInfo {
    pub episodes_to_download: Vec<EntryDownloadEpisode>,
    pub can_batch: bool,
    pub batch_all: bool,
    pub has_inaccurate_schedule: bool,
    pub rewatch: bool,
    pub absolute_offset: i32,
}

impl EntryDownloadInfo {
    /// Plan downloads for `media`. Main episodes are compared to `progress`
    /// by their progress number, which includes `progress_offset`; anything
    /// else at position `i` in the catalogue's episode list counts as `i + 1`.
    /// Returns `None` when the episode count cannot be determined.
    pub fn new(
        media: &Media,
        record: &AniDbRecord,
        files: &[LocalFile],
        progress: i32,
        progress_offset: i32,
        status: Option<ListStatus>,
    ) -> Option<Self> {
        if media.is_status(MediaStatus::NotYetReleased) {
            return Some(Self::default());
        }

        let mut current = media.current_episode_count();
        if current == -1 && record.main_episode_count > 0 {
            current = record.main_episode_count;
        }
        if current < 0 {
            return None;
        }

        let discrepancy = record.discrepancy(current);
        let mut slice: Vec<(i32, String)> = (1..=current).map(|n| (n, n.to_string())).collect();

        match discrepancy {
            Discrepancy::CatalogueCountsEpisodeZero => {
                slice.pop();
                slice.insert(0, (0, "S1".to_string()));
            }
            Discrepancy::CatalogueCountsSpecials => {
                let diff = current - record.main_episode_count;
                slice.truncate(slice.len().saturating_sub(diff as usize));
                for i in 0..diff {
                    slice.push((current - i, format!("S{}", i + 1)));
                }
            }
            Discrepancy::AniDbHasMore | Discrepancy::None => {}
        }

        if let Some(next) = &media.next_airing_episode {
            let aired = (next.episode - 1).max(0) as usize;
            slice.truncate(aired);
        }

        let rewatch = status == Some(ListStatus::Completed);
        let progress = if rewatch { 0 } else { progress.max(0) };

        let has_inaccurate_schedule =
            media.next_airing_episode.is_none() && media.is_status(MediaStatus::Releasing);
        if has_inaccurate_schedule {
            slice.truncate((progress + 1) as usize);
        }

        let main_files: Vec<&LocalFile> = files
            .iter()
            .filter(|f| f.metadata.kind == LocalFileKind::Main)
            .collect();
        let zero_discrepancy = discrepancy == Discrepancy::CatalogueCountsEpisodeZero;

        let episodes_to_download = slice
            .into_iter()
            .enumerate()
            .filter(|(_, (number, _))| {
                !main_files.iter().any(|f| {
                    f.metadata.episode == *number
                        || (zero_discrepancy && *number == 0 && f.metadata.anidb_episode == "S1")
                })
            })
            .map(|(i, (number, key))| {
                let episode = MediaEntryEpisode::from_anidb_key(
                    &key,
                    number,
                    media,
                    Some(record),
                    progress_offset,
                );
                let position = if episode.is_main() {
                    episode.progress_number
                } else {
                    i as i32 + 1
                };
                (position, EntryDownloadEpisode {
                    episode,
                    episode_number: number,
                    anidb_episode: key,
                })
            })
            .filter(|(position, _)| *position > progress)
            .map(|(_, planned)| planned)
            .collect();

        let can_batch =
            media.is_status(MediaStatus::Finished) && media.total_episode_count() > 0;

        Some(Self {
            episodes_to_download,
            can_batch,
            batch_all: can_batch && main_files.is_empty() && progress == 0,
            has_inaccurate_schedule,
            rewatch,
            absolute_offset: record.offset(),
        })
    }

    pub fn episode_numbers(&self) -> Vec<i32> {
        self.episodes_to_download
            .iter()
            .map(|e| e.episode_number)
            .collect()
    }
}
