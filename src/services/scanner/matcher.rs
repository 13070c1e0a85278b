//! Title matching between local files and catalogue media

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::services::filename_parser::{dice_similarity, levenshtein_similarity};
use crate::services::local_file::LocalFile;

use super::media_container::MediaContainer;
use super::summary::ScanSummaryLogger;

/// Below this rating a file stays unmatched
pub const MATCH_THRESHOLD: f64 = 0.5;
/// A main file trailing its group's best rating by more than this is unmatched
const VALIDATION_GAP: f64 = 0.7;
/// Ratings closer than this are considered tied
const EPSILON: f64 = 1e-9;

/// Best candidate for one file
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub media_id: i32,
    pub title: String,
    pub rating: f64,
}

pub struct Matcher<'a> {
    container: &'a MediaContainer,
    summary: &'a ScanSummaryLogger,
}

impl<'a> Matcher<'a> {
    pub fn new(container: &'a MediaContainer, summary: &'a ScanSummaryLogger) -> Self {
        Self { container, summary }
    }

    /// Match every unmatched file in place, then validate the groups
    pub fn match_files(&self, files: &mut [LocalFile]) {
        if files.is_empty() || self.container.is_empty() {
            debug!(files = files.len(), media = self.container.len(), "Nothing to match");
            return;
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let chunk = files.len().div_ceil(workers).max(1);

        std::thread::scope(|scope| {
            for part in files.chunks_mut(chunk) {
                scope.spawn(move || {
                    for file in part {
                        self.match_file(file);
                    }
                });
            }
        });

        self.validate(files);
    }

    fn match_file(&self, file: &mut LocalFile) {
        if file.is_matched() || file.is_frozen() {
            return;
        }
        if file.parsed_title().is_none() {
            self.summary.not_matched(file, "No parsed title found");
            return;
        }

        match self.best_match(file) {
            Some(result) if result.rating >= MATCH_THRESHOLD => {
                trace!(file = %file.name, media_id = result.media_id, rating = result.rating, "File matched");
                self.summary
                    .matched(file, result.media_id, &result.title, result.rating);
                file.media_id = result.media_id;
            }
            Some(result) => {
                self.summary.not_matched(
                    file,
                    &format!(
                        "Rating too low ({:.3} for \"{}\")",
                        result.rating, result.title
                    ),
                );
            }
            None => self.summary.not_matched(file, "No title variations found"),
        }
    }

    /// Highest-rated media for a file. Exact title hits win outright; otherwise
    /// the better of Sørensen–Dice and Levenshtein is kept per candidate.
    pub fn best_match(&self, file: &LocalFile) -> Option<MatchResult> {
        let variations = file.title_variations();
        if variations.is_empty() {
            return None;
        }

        for variation in &variations {
            let ids = self.container.exact_matches(variation);
            if let Some(media_id) = self.disambiguate(file, ids) {
                return Some(MatchResult {
                    media_id,
                    title: variation.clone(),
                    rating: 1.0,
                });
            }
        }

        let mut best: HashMap<i32, (f64, &str)> = HashMap::new();
        for entry in self.container.titles() {
            for variation in &variations {
                let rating = dice_similarity(variation, &entry.title)
                    .max(levenshtein_similarity(variation, &entry.title));
                let slot = best
                    .entry(entry.media_id)
                    .or_insert((0.0, entry.title.as_str()));
                if rating > slot.0 {
                    *slot = (rating, entry.title.as_str());
                }
            }
        }

        best.into_iter()
            .max_by(|(a_id, (a_rating, _)), (b_id, (b_rating, _))| {
                if (a_rating - b_rating).abs() > EPSILON {
                    return a_rating.total_cmp(b_rating);
                }
                self.tie_break(file, *a_id)
                    .cmp(&self.tie_break(file, *b_id))
                    // Lower id wins a full tie
                    .then(b_id.cmp(a_id))
            })
            .map(|(media_id, (rating, title))| MatchResult {
                media_id,
                title: title.to_string(),
                rating,
            })
    }

    /// Pick one of several media sharing a title: parsed season first, then
    /// the list entry being watched, then the lowest id.
    fn disambiguate(&self, file: &LocalFile, ids: &[i32]) -> Option<i32> {
        match ids {
            [] => None,
            [only] => Some(*only),
            _ => ids
                .iter()
                .copied()
                .max_by(|a, b| {
                    self.tie_break(file, *a)
                        .cmp(&self.tie_break(file, *b))
                        .then(b.cmp(a))
                }),
        }
    }

    /// Ordered preference key: (season agrees, format agrees, watching, in list)
    fn tie_break(&self, file: &LocalFile, media_id: i32) -> (bool, bool, bool, bool) {
        let Some(media) = self.container.get(media_id) else {
            return (false, false, false, false);
        };
        let file_season = file.parsed_season().unwrap_or(1);
        let media_season = self.container.media_season(media_id).unwrap_or(1);
        let looks_like_movie = file.parsed_episode().is_none()
            && (file.parsed.year.is_some() || file.name.to_lowercase().contains("movie"));
        (
            file_season == media_season,
            looks_like_movie == media.is_movie(),
            self.container.is_watching(media_id),
            self.container.in_collection(media_id),
        )
    }

    /// Un-match main files whose title trails the best file of the same media
    /// by a wide margin
    fn validate(&self, files: &mut [LocalFile]) {
        let mut groups: HashMap<i32, Vec<usize>> = HashMap::new();
        for (i, file) in files.iter().enumerate() {
            if file.is_matched() && !file.is_frozen() {
                groups.entry(file.media_id).or_default().push(i);
            }
        }

        for (media_id, indices) in groups {
            let Some(media) = self.container.get(media_id) else {
                continue;
            };
            let titles = media.all_titles();

            let ratings: Vec<(usize, Option<f64>)> = indices
                .iter()
                .map(|&i| {
                    let file = &files[i];
                    if file.is_probably_special() || file.is_probably_nc() {
                        return (i, None);
                    }
                    let title = file.parsed_title().unwrap_or_default();
                    let rating = titles
                        .iter()
                        .map(|t| dice_similarity(title, t))
                        .fold(0.0, f64::max);
                    (i, Some(rating))
                })
                .collect();

            let highest = ratings
                .iter()
                .filter_map(|(_, r)| *r)
                .fold(0.0, f64::max);

            for (i, rating) in ratings {
                let Some(rating) = rating else { continue };
                let file = &mut files[i];
                if rating < highest && highest - rating > VALIDATION_GAP {
                    self.summary.not_matched(
                        file,
                        &format!(
                            "Rating does not match the group, file rating {rating:.3}, highest {highest:.3}"
                        ),
                    );
                    debug!(file = %file.name, media_id, "File un-matched by validation");
                    file.media_id = 0;
                }
            }
        }
    }
}
