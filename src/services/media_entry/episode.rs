//! Episodes as presented in a media entry

use serde::Serialize;

use crate::services::anilist::Media;
use crate::services::anizip::{AniDbRecord, EpisodeMetadata};
use crate::services::local_file::{LocalFile, LocalFileKind};

/// Why an episode's metadata may be off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataIssue {
    /// Catalogue episode 0 was mapped onto AniDB's `S1`
    ForcedRemapping,
    NoAnidbData,
}

impl MetadataIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataIssue::ForcedRemapping => "forced_remapping",
            MetadataIssue::NoAnidbData => "no_anidb_data",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryEpisodeMetadata {
    #[serde(rename = "aniDBId", skip_serializing_if = "Option::is_none")]
    pub anidb_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
}

impl EntryEpisodeMetadata {
    fn new(episode: Option<&EpisodeMetadata>, media: &Media) -> Self {
        let cover = media.cover_image_url().map(str::to_string);
        match episode {
            Some(ep) => Self {
                anidb_id: ep.anidb_eid,
                image: ep.image.clone().or(cover),
                air_date: ep.air_date.clone(),
                length: ep.length,
                overview: ep.overview.clone(),
            },
            None => Self {
                image: cover,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEntryEpisode {
    #[serde(rename = "type")]
    pub kind: LocalFileKind,
    pub display_title: String,
    pub episode_title: String,
    pub episode_number: i32,
    /// What the catalogue's list progress counts this episode as
    pub progress_number: i32,
    pub absolute_episode_number: i32,
    #[serde(rename = "aniDBEpisode")]
    pub anidb_episode: String,
    pub local_file: Option<LocalFile>,
    pub episode_metadata: EntryEpisodeMetadata,
    pub is_downloaded: bool,
    pub is_invalid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_issue: Option<MetadataIssue>,
}

impl MediaEntryEpisode {
    /// Episode backed by a file on disk
    pub fn from_local_file(
        file: &LocalFile,
        media: &Media,
        record: Option<&AniDbRecord>,
        progress_offset: i32,
    ) -> Self {
        let key = file.metadata.anidb_episode.clone();
        let found = record.and_then(|r| r.episode(&key));
        let number = file.metadata.episode;

        let mut episode = Self {
            kind: file.metadata.kind,
            display_title: String::new(),
            episode_title: String::new(),
            episode_number: number,
            progress_number: 0,
            absolute_episode_number: 0,
            anidb_episode: key.clone(),
            local_file: Some(file.clone()),
            episode_metadata: EntryEpisodeMetadata::new(found, media),
            is_downloaded: true,
            is_invalid: false,
            metadata_issue: None,
        };

        match file.metadata.kind {
            LocalFileKind::Main => {
                episode.progress_number = number + progress_offset;
                if let (Some(record), Some(_)) = (record, found) {
                    episode.absolute_episode_number = number + record.offset();
                }
                if media.is_movie() {
                    episode.display_title = media.preferred_title();
                    episode.episode_title = "Complete Movie".to_string();
                } else {
                    episode.display_title = format!("Episode {number}");
                    episode.episode_title = found
                        .and_then(EpisodeMetadata::display_title)
                        .map(str::to_string)
                        .or_else(|| file.parsed.episode_title.clone())
                        .unwrap_or_default();
                }
                if progress_offset > 0 && number == 0 && key == "S1" {
                    episode.metadata_issue = Some(MetadataIssue::ForcedRemapping);
                }
                // Hydration could not place the file
                if key.is_empty() {
                    episode.is_invalid = true;
                    episode.display_title = file.parsed_title().unwrap_or(&file.name).to_string();
                    episode.episode_title.clear();
                }
            }
            LocalFileKind::Special => {
                let n = key_number(&key).unwrap_or(number);
                episode.display_title = format!("Special {n}");
                episode.episode_title = found
                    .and_then(EpisodeMetadata::display_title)
                    .unwrap_or_default()
                    .to_string();
            }
            LocalFileKind::Nc => {
                episode.episode_number = 0;
                episode.display_title = nc_title(&key)
                    .or_else(|| found.and_then(EpisodeMetadata::display_title).map(str::to_string))
                    .unwrap_or_else(|| file.parsed_title().unwrap_or(&file.name).to_string());
            }
        }

        if record.is_none() && episode.metadata_issue.is_none() {
            episode.metadata_issue = Some(MetadataIssue::NoAnidbData);
        }
        episode
    }

    /// Episode that is not on disk, described by its AniDB key
    pub fn from_anidb_key(
        key: &str,
        episode_number: i32,
        media: &Media,
        record: Option<&AniDbRecord>,
        progress_offset: i32,
    ) -> Self {
        let found = record.and_then(|r| r.episode(key));
        let kind = key_kind(key);

        let mut episode = Self {
            kind,
            display_title: String::new(),
            episode_title: found
                .and_then(EpisodeMetadata::display_title)
                .unwrap_or_default()
                .to_string(),
            episode_number,
            progress_number: 0,
            absolute_episode_number: 0,
            anidb_episode: key.to_string(),
            local_file: None,
            episode_metadata: EntryEpisodeMetadata::new(found, media),
            is_downloaded: false,
            is_invalid: found.is_none(),
            metadata_issue: None,
        };

        match kind {
            LocalFileKind::Main => {
                episode.progress_number = episode_number + progress_offset;
                if let (Some(record), Some(_)) = (record, found) {
                    episode.absolute_episode_number = episode_number + record.offset();
                }
                if media.is_movie() {
                    episode.display_title = media.preferred_title();
                    episode.episode_title = "Complete Movie".to_string();
                } else {
                    episode.display_title = format!("Episode {episode_number}");
                }
            }
            LocalFileKind::Special => {
                // A catalogue episode 0 that AniDB lists as S1 still counts as progress
                if key == "S1" && progress_offset > 0 && episode_number == 0 {
                    episode.kind = LocalFileKind::Main;
                    episode.progress_number = 1;
                    episode.display_title = "Episode 0".to_string();
                    episode.metadata_issue = Some(MetadataIssue::ForcedRemapping);
                } else {
                    episode.display_title =
                        format!("Special {}", key_number(key).unwrap_or(episode_number));
                }
            }
            LocalFileKind::Nc => {
                episode.display_title = nc_title(key).unwrap_or_else(|| key.to_string());
            }
        }

        if record.is_none() {
            episode.metadata_issue = Some(MetadataIssue::NoAnidbData);
        }
        episode
    }

    pub fn is_main(&self) -> bool {
        self.kind == LocalFileKind::Main
    }
}

/// Kind implied by an AniDB key prefix
pub fn key_kind(key: &str) -> LocalFileKind {
    if key.starts_with('S') {
        LocalFileKind::Special
    } else if key.starts_with("OP") || key.starts_with("ED") {
        LocalFileKind::Nc
    } else {
        LocalFileKind::Main
    }
}

/// Trailing number of a key: `"S2"` -> 2, `"OP1"` -> 1
fn key_number(key: &str) -> Option<i32> {
    let digits = key.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    digits.parse().ok()
}

fn nc_title(key: &str) -> Option<String> {
    let n = key_number(key)?;
    if key.starts_with("OP") {
        Some(format!("Opening {n}"))
    } else if key.starts_with("ED") {
        Some(format!("Ending {n}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::anilist::MediaFormat;
    use crate::services::local_file::LocalFileMetadata;
    use std::collections::HashMap;
    use std::path::Path;

    fn media(format: MediaFormat) -> Media {
        let mut m = Media::new(1, "Violet Evergarden");
        m.format = Some(format);
        m.episodes = Some(13);
        m
    }

    fn local(episode: i32, key: &str, kind: LocalFileKind) -> LocalFile {
        let root = Path::new("/lib");
        let mut lf = LocalFile::new(&root.join(format!("Show - {episode:02}.mkv")), root);
        lf.media_id = 1;
        lf.metadata = LocalFileMetadata {
            episode,
            anidb_episode: key.to_string(),
            kind,
        };
        lf
    }

    fn record() -> AniDbRecord {
        let mut episodes = HashMap::new();
        let mut first = EpisodeMetadata {
            episode: "1".to_string(),
            episode_number: 1,
            absolute_episode_number: 1,
            ..Default::default()
        };
        first.title.insert("en".to_string(), "I Love You".to_string());
        episodes.insert("1".to_string(), first);
        episodes.insert(
            "S1".to_string(),
            EpisodeMetadata {
                episode: "S1".to_string(),
                ..Default::default()
            },
        );
        AniDbRecord {
            episodes,
            main_episode_count: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_main_episode_titles() {
        let record = record();
        let ep = MediaEntryEpisode::from_local_file(
            &local(1, "1", LocalFileKind::Main),
            &media(MediaFormat::Tv),
            Some(&record),
            0,
        );
        assert_eq!(ep.display_title, "Episode 1");
        assert_eq!(ep.episode_title, "I Love You");
        assert_eq!(ep.progress_number, 1);
        assert!(ep.metadata_issue.is_none());
    }

    #[test]
    fn test_movie_titles() {
        let ep = MediaEntryEpisode::from_local_file(
            &local(1, "1", LocalFileKind::Main),
            &media(MediaFormat::Movie),
            Some(&record()),
            0,
        );
        assert_eq!(ep.display_title, "Violet Evergarden");
        assert_eq!(ep.episode_title, "Complete Movie");
    }

    #[test]
    fn test_episode_zero_remapped_to_s1() {
        let ep = MediaEntryEpisode::from_local_file(
            &local(0, "S1", LocalFileKind::Main),
            &media(MediaFormat::Tv),
            Some(&record()),
            1,
        );
        assert_eq!(ep.episode_number, 0);
        assert_eq!(ep.progress_number, 1);
        assert_eq!(ep.metadata_issue, Some(MetadataIssue::ForcedRemapping));
    }

    #[test]
    fn test_special_and_nc_titles() {
        let special = MediaEntryEpisode::from_local_file(
            &local(2, "S2", LocalFileKind::Special),
            &media(MediaFormat::Tv),
            Some(&record()),
            0,
        );
        assert_eq!(special.display_title, "Special 2");
        assert_eq!(special.progress_number, 0);

        let nc = MediaEntryEpisode::from_local_file(
            &local(1, "ED1", LocalFileKind::Nc),
            &media(MediaFormat::Tv),
            Some(&record()),
            0,
        );
        assert_eq!(nc.display_title, "Ending 1");
        assert_eq!(nc.episode_number, 0);
    }

    #[test]
    fn test_unplaced_file_is_invalid() {
        let ep = MediaEntryEpisode::from_local_file(
            &local(40, "", LocalFileKind::Main),
            &media(MediaFormat::Tv),
            None,
            0,
        );
        assert!(ep.is_invalid);
        assert_eq!(ep.metadata_issue, Some(MetadataIssue::NoAnidbData));
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(key_kind("S3"), LocalFileKind::Special);
        assert_eq!(key_kind("OP2"), LocalFileKind::Nc);
        assert_eq!(key_kind("7"), LocalFileKind::Main);
        assert_eq!(key_number("S12"), Some(12));
        assert_eq!(key_number(""), None);
    }
}
