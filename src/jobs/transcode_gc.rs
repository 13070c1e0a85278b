//! Transcode output garbage collection
//!
//! The tracker removes output of streams it killed, but directories left by
//! streams that never got a client again, or by a crash, pile up otherwise.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::media::mediastream::MediastreamRepository;

/// Output untouched for this long is stale
pub const MAX_IDLE: Duration = Duration::from_secs(4 * 60 * 60);

/// Remove stale stream directories of the running transcoder
pub async fn cleanup_cache(mediastream: &MediastreamRepository) -> Result<()> {
    let Ok(transcoder) = mediastream.transcoder() else {
        debug!("Transcoder not running, skipping cleanup");
        return Ok(());
    };
    let active: HashSet<String> = transcoder.active_hashes().into_iter().collect();
    let removed = cleanup_dir(&transcoder.settings().stream_dir, &active, MAX_IDLE).await?;
    info!(removed, "Transcode cache cleanup completed");
    Ok(())
}

/// Remove subdirectories of `dir` not in `active` and not modified for
/// `max_idle`. Returns how many were removed.
pub async fn cleanup_dir(dir: &Path, active: &HashSet<String>, max_idle: Duration) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if active.contains(&name) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let idle = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if idle < max_idle {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                debug!(hash = %name, idle_secs = idle.as_secs(), "Removed stale transcode output");
                removed += 1;
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove transcode output"),
        }
    }
    Ok(removed)
}
