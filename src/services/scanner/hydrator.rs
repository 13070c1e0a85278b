//! Episode metadata for matched files
//!
//! Files are grouped by media and each group is hydrated against the media's
//! AniDB record. Releases that number episodes across a whole franchise are
//! re-homed onto the season that actually contains the episode.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::services::anilist::{Media, MediaFormat};
use crate::services::anizip::{AniDbRecord, EpisodeDb, Platform};
use crate::services::cache::ResultCache;
use crate::services::local_file::{LocalFile, LocalFileKind, LocalFileMetadata};
use crate::services::relation_tree::{RelationTreeBuilder, ordered_seasons};

use super::media_container::MediaContainer;
use super::summary::{LogLevel, ScanSummaryLogger};

/// Outcome of the rules that need no relation tree
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Set(LocalFileMetadata, Option<(LogLevel, &'static str)>),
    /// Episode number is past the media's count
    Absolute(i32),
}

/// Absolute episode span of one season
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeasonRange {
    media_id: i32,
    first: i32,
    last: i32,
}

impl SeasonRange {
    fn relative(&self, episode: i32) -> Option<i32> {
        (self.first..=self.last)
            .contains(&episode)
            .then(|| episode - self.first + 1)
    }
}

pub struct FileHydrator<'a> {
    container: &'a MediaContainer,
    episode_db: Arc<dyn EpisodeDb>,
    anidb_cache: ResultCache<i32, AniDbRecord>,
    tree: RelationTreeBuilder,
    summary: &'a ScanSummaryLogger,
}

impl<'a> FileHydrator<'a> {
    pub fn new(
        container: &'a MediaContainer,
        episode_db: Arc<dyn EpisodeDb>,
        anidb_cache: ResultCache<i32, AniDbRecord>,
        tree: RelationTreeBuilder,
        summary: &'a ScanSummaryLogger,
    ) -> Self {
        Self {
            container,
            episode_db,
            anidb_cache,
            tree,
            summary,
        }
    }

    /// Hydrate every matched, unfrozen file. Groups run one after another;
    /// returns false when cancelled between groups.
    pub async fn hydrate(&self, files: &mut [LocalFile], cancel: &CancellationToken) -> bool {
        let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (i, file) in files.iter().enumerate() {
            if file.is_matched() && !file.is_frozen() {
                groups.entry(file.media_id).or_default().push(i);
            }
        }

        for (media_id, indices) in groups {
            if cancel.is_cancelled() {
                return false;
            }
            self.hydrate_group(media_id, files, &indices).await;
        }
        true
    }

    async fn hydrate_group(&self, media_id: i32, files: &mut [LocalFile], indices: &[usize]) {
        let Some(media) = self.container.get(media_id) else {
            for &i in indices {
                self.summary.error(&files[i], "Matched media is not in the container");
                files[i].media_id = 0;
            }
            return;
        };

        let record = self.record(media_id).await;
        let mut seasons: Option<Vec<SeasonRange>> = None;

        for &i in indices {
            let file = &mut files[i];
            match classify(file, media, record.as_ref()) {
                Step::Set(hydrated, note) => {
                    file.metadata = hydrated;
                    if let Some((level, message)) = note {
                        self.summary.log(file, level, message);
                    }
                }
                Step::Absolute(episode) => {
                    if let Some((relative, key)) = own_range(record.as_ref(), episode) {
                        file.metadata = metadata(relative, key, LocalFileKind::Main);
                        self.summary
                            .info(file, format!("Absolute episode {episode} is episode {relative} of this part"));
                    } else {
                        if seasons.is_none() {
                            seasons = Some(self.season_ranges(media).await);
                        }
                        self.place_absolute(file, episode, seasons.as_deref().unwrap_or_default());
                    }
                }
            }
            self.summary.hydrated(file);
        }
        debug!(media_id, files = indices.len(), "Group hydrated");
    }

    fn place_absolute(&self, file: &mut LocalFile, episode: i32, seasons: &[SeasonRange]) {
        let branch = seasons
            .iter()
            .find_map(|range| range.relative(episode).map(|rel| (range.media_id, rel)));

        match branch {
            Some((media_id, relative)) => {
                if media_id != file.media_id {
                    self.summary.info(
                        file,
                        format!("Absolute episode {episode} moved from media {} to {media_id}", file.media_id),
                    );
                }
                file.media_id = media_id;
                file.metadata = metadata(relative, relative.to_string(), LocalFileKind::Main);
            }
            None => {
                file.metadata = metadata(episode, String::new(), LocalFileKind::Main);
                self.summary.error(
                    file,
                    format!("No season covers absolute episode {episode}"),
                );
            }
        }
    }

    async fn record(&self, media_id: i32) -> Option<AniDbRecord> {
        let db = self.episode_db.clone();
        match self
            .anidb_cache
            .get_or_compute(media_id, move || async move {
                db.media(Platform::Anilist, media_id).await
            })
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(media_id, error = %e, "Failed to fetch AniDB record");
                None
            }
        }
    }

    /// Absolute spans of every main season around `media`, in airing order.
    /// A season's own offset wins; otherwise spans are laid end to end.
    async fn season_ranges(&self, media: &Media) -> Vec<SeasonRange> {
        let tree = match self.tree.build(media).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(media_id = media.id, error = %e, "Failed to build relation tree");
                return Vec::new();
            }
        };

        let mut ranges = Vec::new();
        let mut cumulative = 0;
        for id in ordered_seasons(&tree, media.id) {
            let Some(season) = tree.get(&id) else { continue };
            if !matches!(
                season.format,
                Some(MediaFormat::Tv | MediaFormat::TvShort | MediaFormat::Ona)
            ) {
                continue;
            }
            let record = self.record(id).await;
            let count = record
                .as_ref()
                .map(|r| r.main_episode_count)
                .filter(|c| *c > 0)
                .unwrap_or_else(|| season.current_episode_count());
            if count <= 0 {
                continue;
            }
            let offset = record
                .as_ref()
                .map(AniDbRecord::offset)
                .filter(|o| *o > 0)
                .unwrap_or(cumulative);
            ranges.push(SeasonRange {
                media_id: id,
                first: offset + 1,
                last: offset + count,
            });
            cumulative = offset + count;
        }
        debug!(media_id = media.id, seasons = ranges.len(), "Season ranges computed");
        ranges
    }
}

fn metadata(episode: i32, key: impl Into<String>, kind: LocalFileKind) -> LocalFileMetadata {
    LocalFileMetadata {
        episode,
        anidb_episode: key.into(),
        kind,
    }
}

/// The media's own absolute span, from its first AniDB episode
fn own_range(record: Option<&AniDbRecord>, episode: i32) -> Option<(i32, String)> {
    let record = record?;
    if record.main_episode_count <= 0 {
        return None;
    }

    let offset = record.offset();
    if offset > 0 {
        let span = SeasonRange {
            media_id: 0,
            first: offset + 1,
            last: offset + record.main_episode_count,
        };
        if let Some(rel) = span.relative(episode) {
            return Some((rel, rel.to_string()));
        }
    }

    // Second cours numbered from the start of their season
    let first = record.episode("1")?.episode_number;
    if first > 1 {
        let span = SeasonRange {
            media_id: 0,
            first,
            last: first + record.main_episode_count - 1,
        };
        if let Some(rel) = span.relative(episode) {
            return Some((rel, rel.to_string()));
        }
    }
    None
}

/// Rules that settle a file from its name and the media alone
fn classify(file: &LocalFile, media: &Media, record: Option<&AniDbRecord>) -> Step {
    let episode = file.parsed_episode();
    let current = media.current_episode_count();
    let total = media.total_episode_count();

    if file.is_probably_nc() {
        let key = match (episode, file.nc_kind()) {
            (Some(n), Some(kind)) => format!("{}{n}", kind.prefix()),
            _ => String::new(),
        };
        return Step::Set(metadata(episode.unwrap_or(0), key, LocalFileKind::Nc), None);
    }

    if file.is_probably_special() {
        if media.is_movie() {
            return Step::Set(metadata(1, "1", LocalFileKind::Main), None);
        }
        let number = match episode {
            Some(ep) if current > 0 && ep > current => ep - current,
            Some(ep) => ep,
            None => 1,
        };
        return Step::Set(
            metadata(number, format!("S{number}"), LocalFileKind::Special),
            None,
        );
    }

    if media.is_movie() {
        return Step::Set(metadata(1, "1", LocalFileKind::Main), None);
    }

    match episode {
        Some(0) => {
            let discrepancy = record.is_some_and(|r| r.has_discrepancy(current));
            let key = if discrepancy { "S1" } else { "0" };
            Step::Set(metadata(0, key, LocalFileKind::Main), None)
        }
        Some(ep) if ep <= current || total == -1 => {
            Step::Set(metadata(ep, ep.to_string(), LocalFileKind::Main), None)
        }
        Some(_) if total == 1 => Step::Set(
            metadata(1, "1", LocalFileKind::Main),
            Some((LogLevel::Warning, "Episode number coerced to 1 for a single-episode media")),
        ),
        Some(ep) => Step::Absolute(ep),
        None if current == 1 => Step::Set(
            metadata(1, "1", LocalFileKind::Main),
            Some((LogLevel::Warning, "No episode number, assumed 1 for a single-episode media")),
        ),
        None => Step::Set(
            metadata(1, "S1", LocalFileKind::Special),
            Some((LogLevel::Error, "No episode number found, marked as a special")),
        ),
    }
}
