//! Playback progress tracking
//!
//! [`PlaybackManager`] consumes [`PlayerEvent`]s, resolves the playing file to
//! a matched local file and list entry, and syncs progress to the catalogue
//! (and MAL when linked) at most once per episode.

pub mod players;
pub mod playlist;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::anilist::{AnimeCollection, Catalogue, ListEntry, status_for_progress};
use crate::services::events::{ClientEvent, EventBus};
use crate::services::library_store::LibraryStore;
use crate::services::local_file::LocalFile;
use crate::services::mal::MalSync;
use crate::services::media_entry::{MediaEntry, MediaEntryBuilder};

use players::{PlayerEvent, PlayerStatus, PlayerTracker};
use playlist::PlaylistHub;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("no video is being watched")]
    NoCurrentEntry,

    #[error("media {0} is not in the user's collection")]
    MediaNotInCollection(i32),

    #[error("no local file found for {0}")]
    LocalFileNotFound(String),

    #[error("{0} is not matched to a media")]
    NotMatched(String),

    #[error("failed to update progress on AniList: {0}")]
    ProgressUpdateAnilist(String),

    #[error("failed to update progress on MyAnimeList: {0}")]
    ProgressUpdateMal(String),

    #[error("failed to build the media entry: {0}")]
    Entry(String),
}

/// Sent to clients on every tracking event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    /// Progress number of the playing episode
    pub episode_number: i32,
    pub media_title: String,
    pub media_total_episodes: i32,
    pub media_id: i32,
    pub filename: String,
    pub completion_percentage: f64,
    pub can_play_next: bool,
    pub progress_updated: bool,
}

/// What is playing, once resolved
#[derive(Debug, Clone)]
struct CurrentPlayback {
    list_entry: ListEntry,
    local_file: LocalFile,
    entry: MediaEntry,
}

impl CurrentPlayback {
    fn progress_number(&self) -> i32 {
        self.entry
            .find_episode_by_file(&self.local_file.path)
            .map(|e| e.progress_number)
            .unwrap_or(self.local_file.metadata.episode)
    }

    fn can_play_next(&self) -> bool {
        let next = self.progress_number() + 1;
        self.entry
            .main_episodes()
            .any(|e| e.progress_number == next && e.local_file.is_some())
    }

    fn state(&self, status: &PlayerStatus) -> PlaybackState {
        let media = &self.entry.media;
        PlaybackState {
            episode_number: self.progress_number(),
            media_title: media.preferred_title(),
            media_total_episodes: media.current_episode_count(),
            media_id: media.id,
            filename: status.filename.clone(),
            completion_percentage: status.completion_percentage,
            can_play_next: self.can_play_next(),
            progress_updated: false,
        }
    }
}

#[derive(Default)]
struct TrackingState {
    current: Option<CurrentPlayback>,
    last_status: Option<PlayerStatus>,
    /// Completed states by filename for the current tracking session
    history: HashMap<String, PlaybackState>,
}

pub struct PlaybackManagerOptions {
    pub catalogue: Arc<dyn Catalogue>,
    pub mal: Option<Arc<dyn MalSync>>,
    pub store: Arc<LibraryStore>,
    pub entries: Arc<MediaEntryBuilder>,
    pub tracker: Arc<PlayerTracker>,
    pub events: EventBus,
    pub auto_update_progress: bool,
}

pub struct PlaybackManager {
    catalogue: Arc<dyn Catalogue>,
    mal: Option<Arc<dyn MalSync>>,
    store: Arc<LibraryStore>,
    entries: Arc<MediaEntryBuilder>,
    tracker: Arc<PlayerTracker>,
    playlist: Arc<PlaylistHub>,
    events: EventBus,
    collection: Arc<RwLock<AnimeCollection>>,
    auto_update_progress: AtomicBool,
    state: Mutex<TrackingState>,
    /// Serializes progress writes
    progress_lock: Mutex<()>,
}

impl PlaybackManager {
    pub fn new(options: PlaybackManagerOptions) -> Self {
        let playlist = Arc::new(PlaylistHub::new(
            options.tracker.clone(),
            options.events.clone(),
        ));
        Self {
            catalogue: options.catalogue,
            mal: options.mal,
            store: options.store,
            entries: options.entries,
            tracker: options.tracker,
            playlist,
            events: options.events,
            collection: Arc::new(RwLock::new(AnimeCollection::default())),
            auto_update_progress: AtomicBool::new(options.auto_update_progress),
            state: Mutex::new(TrackingState::default()),
            progress_lock: Mutex::new(()),
        }
    }

    pub fn playlist(&self) -> &Arc<PlaylistHub> {
        &self.playlist
    }

    pub fn tracker(&self) -> &Arc<PlayerTracker> {
        &self.tracker
    }

    pub fn set_auto_update_progress(&self, enabled: bool) {
        self.auto_update_progress.store(enabled, Ordering::Relaxed);
    }

    pub fn set_collection(&self, collection: AnimeCollection) {
        *self.collection.write() = collection;
    }

    pub fn collection(&self) -> AnimeCollection {
        self.collection.read().clone()
    }

    pub async fn refresh_collection(&self) -> anyhow::Result<()> {
        let collection = self.catalogue.user_collection().await?;
        self.set_collection(collection);
        Ok(())
    }

    /// Play a single file, dropping any active playlist
    pub async fn play(&self, path: &str) -> anyhow::Result<()> {
        self.playlist.reset();
        let empty = self.collection.read().lists.is_empty();
        if empty {
            if let Err(e) = self.refresh_collection().await {
                warn!(error = %e, "Could not load the collection before playback");
            }
        }
        self.tracker.play(path).await
    }

    /// Consume player events until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.tracker.subscribe();
        info!("Playback manager listening to player events");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Playback manager stopped");
                    return;
                }
                event = rx.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Playback manager lagged behind player events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    pub async fn handle_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackingStarted(status) => self.on_tracking_started(status).await,
            PlayerEvent::VideoCompleted(status) => self.on_video_completed(status).await,
            PlayerEvent::PlaybackStatus(status) => self.on_playback_status(status).await,
            PlayerEvent::TrackingStopped(reason) => {
                debug!(reason = %reason, "Tracking stopped");
                self.events.send(ClientEvent::ProgressTrackingStopped { reason });
                self.playlist.on_tracking_stopped();
            }
            PlayerEvent::TrackingRetry(_) => self.playlist.on_tracking_error(),
        }
    }

    async fn on_tracking_started(&self, status: PlayerStatus) {
        let mut state = self.state.lock().await;
        state.history.clear();
        state.last_status = Some(status.clone());

        match self.resolve(&status).await {
            Ok(current) => {
                let ps = current.state(&status);
                info!(
                    media_id = ps.media_id,
                    episode = ps.episode_number,
                    title = %ps.media_title,
                    "Playback started"
                );
                self.playlist.on_video_start(&current.local_file);
                state.current = Some(current);
                self.events.send(ClientEvent::ProgressTrackingStarted { state: ps });
            }
            Err(e) => {
                error!(filename = %status.filename, error = %e, "Failed to resolve playing file");
                state.current = None;
                self.events.error_toast(e.to_string());
                self.tracker.cancel();
            }
        }
    }

    async fn on_video_completed(&self, status: PlayerStatus) {
        let mut state = self.state.lock().await;
        state.last_status = Some(status.clone());
        let Some(current) = state.current.clone() else {
            return;
        };

        let mut ps = current.state(&status);
        debug!(filename = %status.filename, "Video completed");
        self.auto_sync(&mut state, &mut ps).await;

        self.events.send(ClientEvent::ProgressVideoCompleted { state: ps.clone() });
        state.history.insert(status.filename.clone(), ps);
        drop(state);

        self.playlist.on_video_completed().await;
    }

    async fn on_playback_status(&self, status: PlayerStatus) {
        let mut state = self.state.lock().await;
        state.last_status = Some(status.clone());
        let Some(current) = &state.current else {
            return;
        };

        // A completed file keeps reporting its recorded state
        let ps = match state.history.get(&status.filename) {
            Some(recorded) => recorded.clone(),
            None => current.state(&status),
        };
        self.events.send(ClientEvent::PlaybackStatus { state: ps });
    }

    /// Filename to matched local file, list entry and media entry
    async fn resolve(&self, status: &PlayerStatus) -> Result<CurrentPlayback, PlaybackError> {
        let local_file = self
            .store
            .find(status.location())
            .or_else(|| self.store.find(&status.filename))
            .ok_or_else(|| PlaybackError::LocalFileNotFound(status.filename.clone()))?;

        if !local_file.is_matched() {
            return Err(PlaybackError::NotMatched(local_file.name.clone()));
        }

        let collection = self.collection();
        let list_entry = collection
            .find_entry(local_file.media_id)
            .cloned()
            .ok_or(PlaybackError::MediaNotInCollection(local_file.media_id))?;

        let files = self.store.files_for_media(local_file.media_id);
        let entry = self
            .entries
            .build(local_file.media_id, &files, &collection)
            .await
            .map_err(|e| PlaybackError::Entry(format!("{e:#}")))?;

        Ok(CurrentPlayback {
            list_entry,
            local_file,
            entry,
        })
    }

    async fn auto_sync(&self, state: &mut TrackingState, ps: &mut PlaybackState) {
        if !self.auto_update_progress.load(Ordering::Relaxed) {
            return;
        }
        let Some(current) = &state.current else {
            return;
        };
        if current.list_entry.progress() >= current.progress_number() {
            debug!(
                progress = current.list_entry.progress(),
                episode = current.progress_number(),
                "List progress already ahead, skipping sync"
            );
            return;
        }

        match self.update_progress(state).await {
            Ok(()) => {
                ps.progress_updated = true;
                self.events.send(ClientEvent::ProgressUpdated { state: ps.clone() });
            }
            Err(e) => {
                ps.progress_updated = false;
                warn!(error = %e, "Automatic progress sync failed");
                self.events.error_toast("Failed to update progress on AniList");
            }
        }
    }

    /// Manually sync the playing episode. Only a catalogue failure is an error;
    /// a file already synced in this session is left alone.
    pub async fn sync_current_progress(&self) -> Result<(), PlaybackError> {
        let mut state = self.state.lock().await;
        let Some(current) = state.current.clone() else {
            return Err(PlaybackError::NoCurrentEntry);
        };
        let status = state.last_status.clone().unwrap_or_default();

        if state
            .history
            .get(&status.filename)
            .is_some_and(|h| h.progress_updated)
        {
            debug!(filename = %status.filename, "Progress already synced");
            return Ok(());
        }

        self.update_progress(&mut state).await?;

        let mut ps = current.state(&status);
        ps.progress_updated = true;
        state.history.insert(status.filename.clone(), ps.clone());
        self.events.send(ClientEvent::ProgressUpdated { state: ps });
        drop(state);

        let catalogue = self.catalogue.clone();
        let collection = self.collection.clone();
        tokio::spawn(async move {
            match catalogue.user_collection().await {
                Ok(fresh) => *collection.write() = fresh,
                Err(e) => warn!(error = %e, "Failed to refresh the collection"),
            }
        });
        Ok(())
    }

    async fn update_progress(&self, state: &mut TrackingState) -> Result<(), PlaybackError> {
        let _guard = self.progress_lock.lock().await;
        let current = state.current.as_mut().ok_or(PlaybackError::NoCurrentEntry)?;

        let media = &current.entry.media;
        let media_id = media.id;
        let progress = current.progress_number();
        let total = Some(media.total_episode_count()).filter(|t| *t > 0);

        self.catalogue
            .update_entry_progress(media_id, progress, total)
            .await
            .map_err(|e| {
                error!(media_id, progress, error = %e, "Progress update failed");
                PlaybackError::ProgressUpdateAnilist(format!("{e:#}"))
            })?;
        info!(media_id, progress, "Updated progress on AniList");

        let status = status_for_progress(progress, total);
        current.list_entry.progress = Some(progress);
        if status.is_some() {
            current.list_entry.status = status;
        }
        self.collection.write().set_progress(media_id, progress, status);

        if let (Some(mal), Some(mal_id)) = (&self.mal, media.id_mal) {
            match mal.update_progress(mal_id, progress, total).await {
                Ok(()) => info!(mal_id, progress, "Updated progress on MyAnimeList"),
                Err(e) => {
                    let e = PlaybackError::ProgressUpdateMal(format!("{e:#}"));
                    warn!(mal_id, error = %e, "MAL sync failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::players::testing::{ScriptedPlayer, status};
    use super::*;
    use crate::services::anilist::{ListGroup, ListStatus, Media, MediaFormat, MediaStatus};
    use crate::services::anizip::{AniDbRecord, EpisodeDb, Platform};
    use crate::services::local_file::LocalFileMetadata;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::Duration;

    const MEDIA_ID: i32 = 154587;

    struct FakeCatalogue {
        collection: AnimeCollection,
        writes: SyncMutex<Vec<(i32, i32)>>,
        fail: bool,
    }

    #[async_trait]
    impl Catalogue for FakeCatalogue {
        async fn media_by_id(&self, id: i32) -> anyhow::Result<Media> {
            anyhow::bail!("unknown media {id}")
        }
        async fn user_collection(&self) -> anyhow::Result<AnimeCollection> {
            Ok(self.collection.clone())
        }
        async fn search_ids(&self, _title: &str) -> anyhow::Result<Vec<i32>> {
            Ok(Vec::new())
        }
        async fn update_entry_progress(
            &self,
            media_id: i32,
            progress: i32,
            _total: Option<i32>,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("catalogue down");
            }
            self.writes.lock().push((media_id, progress));
            Ok(())
        }
        async fn add_to_planning(&self, _ids: &[i32]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingMal;

    #[async_trait]
    impl MalSync for FailingMal {
        async fn update_progress(&self, _: i32, _: i32, _: Option<i32>) -> anyhow::Result<()> {
            anyhow::bail!("MAL down")
        }
    }

    struct NoRecords;

    #[async_trait]
    impl EpisodeDb for NoRecords {
        async fn media(&self, _: Platform, id: i32) -> anyhow::Result<AniDbRecord> {
            anyhow::bail!("no record for {id}")
        }
    }

    fn collection(progress: i32) -> AnimeCollection {
        let mut media = Media::new(MEDIA_ID, "Sousou no Frieren");
        media.format = Some(MediaFormat::Tv);
        media.status = Some(MediaStatus::Finished);
        media.episodes = Some(28);
        media.id_mal = Some(52991);
        AnimeCollection {
            lists: vec![ListGroup {
                status: Some(ListStatus::Current),
                entries: vec![ListEntry {
                    id: 1,
                    status: Some(ListStatus::Current),
                    progress: Some(progress),
                    score: None,
                    repeat: None,
                    media,
                }],
            }],
        }
    }

    async fn manager(
        dir: &Path,
        catalogue: Arc<FakeCatalogue>,
        auto: bool,
    ) -> (Arc<PlaybackManager>, broadcast::Receiver<ClientEvent>) {
        let store = Arc::new(LibraryStore::open(dir).await.unwrap());
        let root = Path::new("/lib");
        let files = (5..=7)
            .map(|ep| {
                let mut lf = LocalFile::new(&root.join(format!("ep{ep:02}.mkv")), root);
                lf.media_id = MEDIA_ID;
                lf.metadata = LocalFileMetadata {
                    episode: ep,
                    anidb_episode: ep.to_string(),
                    ..Default::default()
                };
                lf
            })
            .collect();
        store.save_local_files(files).await.unwrap();

        let events = EventBus::default();
        let rx = events.subscribe();
        let tracker = Arc::new(PlayerTracker::with_poll_interval(
            Arc::new(ScriptedPlayer::default()),
            Duration::from_secs(3600),
        ));
        let manager = PlaybackManager::new(PlaybackManagerOptions {
            catalogue: catalogue.clone(),
            mal: Some(Arc::new(FailingMal)),
            store,
            entries: Arc::new(MediaEntryBuilder::new(catalogue.clone(), Arc::new(NoRecords))),
            tracker,
            events,
            auto_update_progress: auto,
        });
        manager.set_collection(catalogue.collection.clone());
        (Arc::new(manager), rx)
    }

    fn catalogue(progress: i32, fail: bool) -> Arc<FakeCatalogue> {
        Arc::new(FakeCatalogue {
            collection: collection(progress),
            writes: SyncMutex::new(Vec::new()),
            fail,
        })
    }

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_completed_video_syncs_once() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue(5, false);
        let (pm, mut rx) = manager(dir.path(), cat.clone(), true).await;

        pm.handle_event(PlayerEvent::TrackingStarted(status("ep06.mkv", 0.1))).await;
        pm.handle_event(PlayerEvent::VideoCompleted(status("ep06.mkv", 0.95))).await;
        pm.handle_event(PlayerEvent::PlaybackStatus(status("ep06.mkv", 0.97))).await;

        assert_eq!(*cat.writes.lock(), vec![(MEDIA_ID, 6)]);

        let events = drain(&mut rx);
        let started = events
            .iter()
            .find_map(|e| match e {
                ClientEvent::ProgressTrackingStarted { state } => Some(state.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(started.episode_number, 6);
        assert!(started.can_play_next);

        let last_status = events
            .iter()
            .rev()
            .find_map(|e| match e {
                ClientEvent::PlaybackStatus { state } => Some(state.clone()),
                _ => None,
            })
            .unwrap();
        assert!(last_status.progress_updated);

        // Manual sync of the same file writes nothing
        pm.sync_current_progress().await.unwrap();
        assert_eq!(cat.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_sync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue(5, false);
        let (pm, _rx) = manager(dir.path(), cat.clone(), false).await;

        pm.handle_event(PlayerEvent::TrackingStarted(status("ep06.mkv", 0.5))).await;
        pm.sync_current_progress().await.unwrap();
        pm.sync_current_progress().await.unwrap();

        assert_eq!(*cat.writes.lock(), vec![(MEDIA_ID, 6)]);
    }

    #[tokio::test]
    async fn test_auto_sync_skips_when_list_is_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalogue(7, false);
        let (pm, _rx) = manager(dir.path(), cat.clone(), true).await;

        pm.handle_event(PlayerEvent::TrackingStarted(status("ep06.mkv", 0.1))).await;
        pm.handle_event(PlayerEvent::VideoCompleted(status("ep06.mkv", 0.95))).await;
        assert!(cat.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_without_playback_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (pm, _rx) = manager(dir.path(), catalogue(0, false), true).await;
        assert_matches!(
            pm.sync_current_progress().await,
            Err(PlaybackError::NoCurrentEntry)
        );
    }

    #[tokio::test]
    async fn test_catalogue_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let (pm, _rx) = manager(dir.path(), catalogue(0, true), false).await;
        pm.handle_event(PlayerEvent::TrackingStarted(status("ep06.mkv", 0.5))).await;
        assert_matches!(
            pm.sync_current_progress().await,
            Err(PlaybackError::ProgressUpdateAnilist(_))
        );
    }

    #[tokio::test]
    async fn test_unknown_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (pm, mut rx) = manager(dir.path(), catalogue(0, false), true).await;
        pm.handle_event(PlayerEvent::TrackingStarted(status("other.mkv", 0.1))).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ClientEvent::ErrorToast { .. })));
        assert_matches!(
            pm.sync_current_progress().await,
            Err(PlaybackError::NoCurrentEntry)
        );
    }
}
