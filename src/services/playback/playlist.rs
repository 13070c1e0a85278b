//! Sequential playback of queued local files

use std::sync::Arc;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::players::PlayerTracker;
use crate::services::events::{ClientEvent, EventBus};
use crate::services::local_file::LocalFile;

/// What clients see of the active playlist
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSnapshot {
    pub name: String,
    pub files: Vec<String>,
    pub current_index: usize,
    pub paused: bool,
}

#[derive(Debug)]
struct Playlist {
    name: String,
    files: Vec<LocalFile>,
    position: usize,
    current_completed: bool,
    paused: bool,
}

impl Playlist {
    fn snapshot(&self) -> PlaylistSnapshot {
        PlaylistSnapshot {
            name: self.name.clone(),
            files: self.files.iter().map(|f| f.path.clone()).collect(),
            current_index: self.position,
            paused: self.paused,
        }
    }

    fn is_last(&self) -> bool {
        self.position + 1 >= self.files.len()
    }
}

pub struct PlaylistHub {
    tracker: Arc<PlayerTracker>,
    events: EventBus,
    current: Mutex<Option<Playlist>>,
}

impl PlaylistHub {
    pub fn new(tracker: Arc<PlayerTracker>, events: EventBus) -> Self {
        Self {
            tracker,
            events,
            current: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Option<PlaylistSnapshot> {
        self.current.lock().as_ref().map(Playlist::snapshot)
    }

    pub fn is_active(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Replace the active playlist and open its first file
    pub async fn start(&self, name: impl Into<String>, files: Vec<LocalFile>) -> Result<()> {
        let Some(first) = files.first().map(|f| f.path.clone()) else {
            bail!("playlist is empty");
        };
        let name = name.into();
        info!(playlist = %name, files = files.len(), "Starting playlist");

        *self.current.lock() = Some(Playlist {
            name,
            files,
            position: 0,
            current_completed: false,
            paused: false,
        });
        self.publish();

        if let Err(e) = self.tracker.play(&first).await {
            self.reset();
            return Err(e);
        }
        Ok(())
    }

    /// Resume a paused playlist from its current file
    pub async fn resume(&self) -> Result<()> {
        let path = {
            let mut guard = self.current.lock();
            let Some(playlist) = guard.as_mut() else {
                bail!("no active playlist");
            };
            playlist.paused = false;
            playlist.current_completed = false;
            playlist.files[playlist.position].path.clone()
        };
        self.publish();
        self.tracker.play(&path).await
    }

    pub fn reset(&self) {
        if self.current.lock().take().is_some() {
            debug!("Playlist cleared");
            self.publish();
        }
    }

    /// Point the queue at `file` when the player started something from it
    pub fn on_video_start(&self, file: &LocalFile) {
        let mut guard = self.current.lock();
        if let Some(playlist) = guard.as_mut() {
            if let Some(index) = playlist.files.iter().position(|f| f.path == file.path) {
                playlist.position = index;
                playlist.current_completed = false;
            }
        }
    }

    /// Open the next file, or finish when the last one completed
    pub async fn on_video_completed(&self) {
        let next = {
            let mut guard = self.current.lock();
            let Some(playlist) = guard.as_mut() else {
                return;
            };
            playlist.current_completed = true;
            if playlist.is_last() {
                None
            } else {
                playlist.position += 1;
                playlist.current_completed = false;
                Some(playlist.files[playlist.position].path.clone())
            }
        };

        match next {
            Some(path) => {
                self.publish();
                debug!(path = %path, "Playing next playlist entry");
                if let Err(e) = self.tracker.play(&path).await {
                    warn!(error = %e, "Failed to open next playlist entry");
                    self.events.error_toast("Could not play the next episode");
                    self.pause();
                }
            }
            None => {
                info!("Playlist finished");
                self.reset();
            }
        }
    }

    /// The player went away before the current file completed
    pub fn on_tracking_stopped(&self) {
        let unfinished = self
            .current
            .lock()
            .as_ref()
            .is_some_and(|p| !p.current_completed);
        if unfinished {
            self.pause();
        }
    }

    pub fn on_tracking_error(&self) {
        if self.is_active() {
            debug!("Player unreachable during playlist");
        }
    }

    fn pause(&self) {
        if let Some(playlist) = self.current.lock().as_mut() {
            playlist.paused = true;
        }
        self.publish();
    }

    fn publish(&self) {
        self.events.send(ClientEvent::PlaylistState {
            playlist: self.snapshot(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::playback::players::testing::ScriptedPlayer;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::Duration;

    fn files(n: usize) -> Vec<LocalFile> {
        let root = Path::new("/lib");
        (1..=n)
            .map(|i| LocalFile::new(&root.join(format!("Show - {i:02}.mkv")), root))
            .collect()
    }

    fn hub() -> (PlaylistHub, Arc<ScriptedPlayer>) {
        let player = Arc::new(ScriptedPlayer::default());
        let tracker = Arc::new(PlayerTracker::with_poll_interval(
            player.clone(),
            Duration::from_secs(3600),
        ));
        (PlaylistHub::new(tracker, EventBus::default()), player)
    }

    #[tokio::test]
    async fn test_completion_opens_next_file() {
        let (hub, player) = hub();
        hub.start("Show", files(2)).await.unwrap();
        hub.on_video_completed().await;

        assert_eq!(
            *player.opened.lock(),
            vec!["/lib/Show - 01.mkv".to_string(), "/lib/Show - 02.mkv".to_string()]
        );
        assert_eq!(hub.snapshot().unwrap().current_index, 1);

        hub.on_video_completed().await;
        assert!(hub.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_stopping_early_pauses() {
        let (hub, _) = hub();
        hub.start("Show", files(3)).await.unwrap();
        hub.on_tracking_stopped();

        let snapshot = hub.snapshot().unwrap();
        assert!(snapshot.paused);
        assert_eq!(snapshot.current_index, 0);

        hub.resume().await.unwrap();
        assert!(!hub.snapshot().unwrap().paused);
    }

    #[tokio::test]
    async fn test_empty_playlist_is_rejected() {
        let (hub, _) = hub();
        assert!(hub.start("Empty", Vec::new()).await.is_err());
        assert!(!hub.is_active());
    }
}
