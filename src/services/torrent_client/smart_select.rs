//! Download only the episodes a media is missing from a batch torrent

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use super::{TorrentClient, TorrentClientError, TorrentFile};
use crate::services::anilist::Media;
use crate::services::filename_parser::{self, dice_similarity, levenshtein_similarity};
use crate::services::local_file::is_video_file;
use crate::services::scanner::MATCH_THRESHOLD;

/// Polls while the daemon resolves magnet metadata
const METADATA_ATTEMPTS: u32 = 30;
const METADATA_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SmartSelect {
    pub magnet: String,
    pub media: Media,
    pub missing_episode_numbers: Vec<i32>,
    /// Episode-DB offset used when the torrent numbers episodes absolutely
    pub absolute_offset: i32,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmartSelection {
    pub hash: String,
    /// `(file index, episode)` of every file kept
    pub selected: Vec<(usize, i32)>,
    pub deselected: Vec<usize>,
}

/// Lowercased BitTorrent info hash of a magnet link
pub fn info_hash_from_magnet(magnet: &str) -> Option<String> {
    let url = Url::parse(magnet).ok()?;
    if url.scheme() != "magnet" {
        return None;
    }
    url.query_pairs()
        .filter(|(k, _)| k == "xt")
        .find_map(|(_, v)| v.strip_prefix("urn:btih:").map(str::to_lowercase))
}

/// Add the magnet and set priority 0 on every file that is not a missing
/// episode of `request.media`.
pub async fn smart_select(
    client: &dyn TorrentClient,
    request: &SmartSelect,
) -> Result<SmartSelection, TorrentClientError> {
    let hash = info_hash_from_magnet(&request.magnet)
        .ok_or_else(|| TorrentClientError::Backend("invalid magnet link".into()))?;

    client
        .add_magnets(std::slice::from_ref(&request.magnet), &request.destination)
        .await?;

    let files = wait_for_files(client, &hash).await?;
    let selection = select_files(&hash, &files, request);

    if selection.selected.is_empty() {
        warn!(hash, media_id = request.media.id, "No file matches a missing episode");
        client.remove_torrents(std::slice::from_ref(&hash)).await?;
        return Err(TorrentClientError::NoMatchingFiles);
    }

    if !selection.deselected.is_empty() {
        if let Err(e) = client.set_file_priority(&hash, &selection.deselected, 0).await {
            warn!(hash, error = %e, "Could not deselect files, removing torrent");
            client.remove_torrents(std::slice::from_ref(&hash)).await?;
            return Err(e);
        }
    }

    info!(
        hash,
        media_id = request.media.id,
        selected = selection.selected.len(),
        deselected = selection.deselected.len(),
        "Smart select applied"
    );
    Ok(selection)
}

async fn wait_for_files(
    client: &dyn TorrentClient,
    hash: &str,
) -> Result<Vec<TorrentFile>, TorrentClientError> {
    for attempt in 1..=METADATA_ATTEMPTS {
        let files = client.get_files(hash).await?;
        if !files.is_empty() {
            return Ok(files);
        }
        debug!(hash, attempt, "Waiting for torrent metadata");
        tokio::time::sleep(METADATA_POLL).await;
    }
    Err(TorrentClientError::Backend(format!(
        "metadata for {hash} was not resolved in time"
    )))
}

/// Pure selection over a resolved file list
pub fn select_files(hash: &str, files: &[TorrentFile], request: &SmartSelect) -> SmartSelection {
    let current = request.media.current_episode_count();
    let titles = request.media.all_titles();

    let candidates: Vec<(usize, i32)> = files
        .iter()
        .filter(|f| is_video_file(Path::new(f.file_name())))
        .filter_map(|f| {
            let parsed = filename_parser::parse(f.file_name());
            let episode = parsed.episode()? as i32;
            let matches_media = match &parsed.title {
                Some(title) => titles.iter().any(|t| {
                    dice_similarity(title, t).max(levenshtein_similarity(title, t)) >= MATCH_THRESHOLD
                }),
                None => true,
            };
            matches_media.then_some((f.index, episode))
        })
        .collect();

    let absolute = current > 0 && candidates.iter().any(|(_, ep)| *ep > current);
    let missing: HashSet<i32> = request.missing_episode_numbers.iter().copied().collect();

    let selected: Vec<(usize, i32)> = candidates
        .into_iter()
        .map(|(index, ep)| {
            if absolute {
                (index, ep - request.absolute_offset)
            } else {
                (index, ep)
            }
        })
        .filter(|(_, ep)| missing.contains(ep))
        .collect();

    let kept: HashSet<usize> = selected.iter().map(|(i, _)| *i).collect();
    let deselected = files
        .iter()
        .map(|f| f.index)
        .filter(|i| !kept.contains(i))
        .collect();

    SmartSelection {
        hash: hash.to_string(),
        selected,
        deselected,
    }
}
