//! Library scanner
//!
//! Walks the library, matches every new video to a catalogue media and
//! hydrates its episode metadata. Phases run strictly in order:
//!
//! 1. collect video paths
//! 2. keep locked/ignored files from the previous scan
//! 3. fetch the user's collection (and related media when enhanced)
//! 4. match titles
//! 5. hydrate episode numbers
//! 6. add newly discovered media to the planning list
//! 7. persist files and a scan summary

pub mod hydrator;
pub mod matcher;
pub mod media_container;
pub mod media_fetcher;
pub mod summary;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::anilist::{AnimeCollection, Catalogue};
use super::anizip::EpisodeDb;
use super::cache::ResultCache;
use super::events::{ClientEvent, EventBus};
use super::library_store::LibraryStore;
use super::local_file::{LocalFile, is_video_file, normalize_path};
use super::relation_tree::RelationTreeBuilder;

pub use hydrator::FileHydrator;
pub use matcher::{MATCH_THRESHOLD, MatchResult, Matcher};
pub use media_container::MediaContainer;
pub use media_fetcher::{FetchedMedia, MediaFetcher};
pub use summary::{ScanSummary, ScanSummaryFile, ScanSummaryGroup, ScanSummaryLogger};

/// Planning additions are skipped when a scan discovers this many unknown media
const MAX_PLANNING_ADDITIONS: usize = 5;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No local files found")]
    NoLocalFiles,

    #[error("Scan cancelled")]
    Cancelled,

    #[error("User collection unavailable: {0}")]
    CollectionUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Search the catalogue for titles outside the user's collection
    pub enhanced: bool,
}

/// Result of a completed scan
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub files: Vec<LocalFile>,
    pub summary: ScanSummary,
}

pub struct Scanner {
    library_path: PathBuf,
    catalogue: Arc<dyn Catalogue>,
    episode_db: Arc<dyn EpisodeDb>,
    store: Arc<LibraryStore>,
    events: EventBus,
    /// One scan at a time
    running: tokio::sync::Mutex<()>,
}

impl Scanner {
    pub fn new(
        library_path: impl Into<PathBuf>,
        catalogue: Arc<dyn Catalogue>,
        episode_db: Arc<dyn EpisodeDb>,
        store: Arc<LibraryStore>,
        events: EventBus,
    ) -> Self {
        Self {
            library_path: library_path.into(),
            catalogue,
            episode_db,
            store,
            events,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }

    fn progress(&self, percent: u8, message: &str) {
        self.events.send(ClientEvent::ScanProgress {
            percent,
            message: message.to_string(),
        });
    }

    /// Run every phase and persist the result
    pub async fn scan(
        &self,
        options: ScanOptions,
        cancel: CancellationToken,
    ) -> Result<ScanOutcome, ScanError> {
        let _guard = self.running.lock().await;
        let started = Instant::now();
        info!(
            path = %self.library_path.display(),
            enhanced = options.enhanced,
            "Starting library scan"
        );
        self.progress(0, "Retrieving local files...");

        // Collect paths
        let phase = Instant::now();
        let root = self.library_path.clone();
        let paths = tokio::task::spawn_blocking(move || collect_video_paths(&root))
            .await
            .map_err(|e| anyhow::anyhow!("Path collection task failed: {e}"))?;
        debug!(count = paths.len(), ms = phase.elapsed().as_millis() as u64, "Video paths collected");
        if paths.is_empty() {
            warn!(path = %self.library_path.display(), "No video files in library");
            self.progress(100, "No local files found");
            return Err(ScanError::NoLocalFiles);
        }
        self.check(&cancel)?;

        // Reconcile with the previous scan
        self.progress(20, "Verifying existing files...");
        let present: HashSet<String> = paths.iter().map(|p| normalize_path(&p.to_string_lossy())).collect();
        let retained: Vec<LocalFile> = self
            .store
            .local_files()
            .into_iter()
            .filter(|f| f.is_frozen() && present.contains(&f.normalized_path()))
            .collect();
        let retained_paths: HashSet<String> = retained.iter().map(LocalFile::normalized_path).collect();
        let mut files: Vec<LocalFile> = paths
            .iter()
            .filter(|p| !retained_paths.contains(&normalize_path(&p.to_string_lossy())))
            .map(|p| LocalFile::new(p, &self.library_path))
            .collect();
        debug!(new = files.len(), retained = retained.len(), "Existing files reconciled");

        let summary_logger = ScanSummaryLogger::new();
        let (container, collection) = if files.is_empty() {
            (MediaContainer::default(), AnimeCollection::default())
        } else {
            // Fetch catalogue media
            self.progress(
                40,
                if options.enhanced { "Fetching additional matching data..." } else { "Fetching media..." },
            );
            let phase = Instant::now();
            let tree = RelationTreeBuilder::new(self.catalogue.clone(), ResultCache::new());
            let fetcher = MediaFetcher::new(self.catalogue.clone(), tree.clone());
            let fetched = fetcher
                .fetch(&files, options.enhanced, &cancel)
                .await
                .map_err(|e| ScanError::CollectionUnavailable(format!("{e:#}")))?;
            let container = MediaContainer::new(fetched.media, &fetched.collection);
            debug!(media = container.len(), ms = phase.elapsed().as_millis() as u64, "Media fetched");
            self.check(&cancel)?;

            // Match
            self.progress(50, "Matching local files...");
            let phase = Instant::now();
            Matcher::new(&container, &summary_logger).match_files(&mut files);
            let matched = files.iter().filter(|f| f.is_matched()).count();
            debug!(matched, total = files.len(), ms = phase.elapsed().as_millis() as u64, "Files matched");
            self.check(&cancel)?;

            // Hydrate
            self.progress(70, "Hydrating metadata...");
            let phase = Instant::now();
            let hydrator = FileHydrator::new(
                &container,
                self.episode_db.clone(),
                ResultCache::new(),
                tree,
                &summary_logger,
            );
            if !hydrator.hydrate(&mut files, &cancel).await {
                return Err(ScanError::Cancelled);
            }
            debug!(ms = phase.elapsed().as_millis() as u64, "Files hydrated");

            // Planning list
            self.progress(80, "Adding missing media...");
            self.add_unknown_to_planning(&container).await;

            (container, fetched.collection)
        };
        self.check(&cancel)?;

        // Summary and persistence
        self.progress(90, "Saving scan summary...");
        files.extend(retained);
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let summary = summary_logger.generate(&files, &container, &collection);
        if let Err(e) = self.store.save_summary(&summary.id, &summary).await {
            warn!(error = %e, "Failed to save scan summary");
        }
        self.store.save_local_files(files.clone()).await?;

        self.progress(100, "Scan completed");
        info!(
            files = files.len(),
            unmatched = summary.unmatched_files.len(),
            errors = summary.error_count(),
            ms = started.elapsed().as_millis() as u64,
            "Library scan completed"
        );
        Ok(ScanOutcome { files, summary })
    }

    fn check(&self, cancel: &CancellationToken) -> Result<(), ScanError> {
        if cancel.is_cancelled() {
            info!("Library scan cancelled");
            return Err(ScanError::Cancelled);
        }
        Ok(())
    }

    async fn add_unknown_to_planning(&self, container: &MediaContainer) {
        let unknown = container.unknown_ids();
        if unknown.is_empty() {
            return;
        }
        if unknown.len() >= MAX_PLANNING_ADDITIONS {
            debug!(count = unknown.len(), "Too many unknown media, planning list left alone");
            return;
        }
        match self.catalogue.add_to_planning(&unknown).await {
            Ok(()) => info!(media_ids = ?unknown, "Added discovered media to planning"),
            Err(e) => warn!(error = %e, "Failed to add media to planning"),
        }
    }
}

/// Every video below `root`, in walk order
pub fn collect_video_paths(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_video_file(e.path()))
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::anilist::{ListEntry, ListGroup, ListStatus, Media, MediaFormat};
    use crate::services::anizip::{AniDbRecord, Platform};
    use anyhow::{Result, anyhow};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FakeCatalogue {
        collection: AnimeCollection,
        planned: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Catalogue for FakeCatalogue {
        async fn media_by_id(&self, id: i32) -> Result<Media> {
            self.collection
                .find_entry(id)
                .map(|e| e.media.clone())
                .ok_or_else(|| anyhow!("unknown media {id}"))
        }
        async fn user_collection(&self) -> Result<AnimeCollection> {
            Ok(self.collection.clone())
        }
        async fn search_ids(&self, _title: &str) -> Result<Vec<i32>> {
            Ok(Vec::new())
        }
        async fn update_entry_progress(&self, _: i32, _: i32, _: Option<i32>) -> Result<()> {
            Ok(())
        }
        async fn add_to_planning(&self, ids: &[i32]) -> Result<()> {
            self.planned.lock().extend_from_slice(ids);
            Ok(())
        }
    }

    struct NoRecords;

    #[async_trait]
    impl EpisodeDb for NoRecords {
        async fn media(&self, _platform: Platform, id: i32) -> Result<AniDbRecord> {
            Err(anyhow!("no record for {id}"))
        }
    }

    fn frieren_collection() -> AnimeCollection {
        let mut media = Media::new(154587, "Sousou no Frieren");
        media.title.english = Some("Frieren: Beyond Journey's End".to_string());
        media.format = Some(MediaFormat::Tv);
        media.episodes = Some(28);
        AnimeCollection {
            lists: vec![ListGroup {
                status: Some(ListStatus::Current),
                entries: vec![ListEntry {
                    id: 1,
                    status: Some(ListStatus::Current),
                    progress: Some(2),
                    score: None,
                    repeat: None,
                    media,
                }],
            }],
        }
    }

    async fn scanner(dir: &TempDir) -> (Scanner, Arc<LibraryStore>) {
        let library = dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let store = Arc::new(LibraryStore::open(dir.path().join("data")).await.unwrap());
        let catalogue = Arc::new(FakeCatalogue {
            collection: frieren_collection(),
            planned: Mutex::new(Vec::new()),
        });
        let scanner = Scanner::new(library, catalogue, Arc::new(NoRecords), store.clone(), EventBus::default());
        (scanner, store)
    }

    fn touch(dir: &TempDir, relative: &str) {
        let path = dir.path().join("library").join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[tokio::test]
    async fn test_empty_library_fails() {
        let dir = TempDir::new().unwrap();
        let (scanner, _) = scanner(&dir).await;
        let result = scanner.scan(ScanOptions::default(), CancellationToken::new()).await;
        assert_matches!(result, Err(ScanError::NoLocalFiles));
    }

    #[tokio::test]
    async fn test_scan_matches_and_persists() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "Frieren/[SubsPlease] Sousou no Frieren - 03 (1080p).mkv");
        touch(&dir, "Frieren/[SubsPlease] Sousou no Frieren - 03 (1080p).srt");
        touch(&dir, "Other/[Group] Totally Unrelated Show - 01.mp4");
        let (scanner, store) = scanner(&dir).await;

        let outcome = scanner
            .scan(ScanOptions::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.files.len(), 2);
        let frieren = outcome.files.iter().find(|f| f.name.contains("Frieren")).unwrap();
        assert_eq!(frieren.media_id, 154587);
        assert_eq!(frieren.metadata.episode, 3);
        assert_eq!(frieren.metadata.anidb_episode, "3");
        assert_eq!(outcome.summary.unmatched_files.len(), 1);
        assert_eq!(store.local_files().len(), 2);
        assert_eq!(store.summary_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_locked_files_survive_rescan() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "Show/[Group] Sousou no Frieren - 05.mkv");
        let (scanner, store) = scanner(&dir).await;

        let first = scanner
            .scan(ScanOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        let path = first.files[0].path.clone();
        store
            .update_local_file(&path, |f| {
                f.locked = true;
                f.metadata.episode = 99;
            })
            .await
            .unwrap();

        let second = scanner
            .scan(ScanOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.files.len(), 1);
        assert_eq!(second.files[0].metadata.episode, 99);
    }

    #[tokio::test]
    async fn test_deleted_files_are_dropped() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "[Group] Sousou no Frieren - 01.mkv");
        touch(&dir, "[Group] Sousou no Frieren - 02.mkv");
        let (scanner, store) = scanner(&dir).await;
        scanner.scan(ScanOptions::default(), CancellationToken::new()).await.unwrap();

        std::fs::remove_file(dir.path().join("library/[Group] Sousou no Frieren - 02.mkv")).unwrap();
        scanner.scan(ScanOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(store.local_files().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_stops() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "[Group] Sousou no Frieren - 01.mkv");
        let (scanner, store) = scanner(&dir).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = scanner.scan(ScanOptions::default(), cancel).await;
        assert_matches!(result, Err(ScanError::Cancelled));
        assert!(store.local_files().is_empty());
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "[Group] Sousou no Frieren - 01.mkv");
        let (scanner, _) = scanner(&dir).await;
        let mut rx = scanner.events.subscribe();

        scanner.scan(ScanOptions::default(), CancellationToken::new()).await.unwrap();

        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            if let ClientEvent::ScanProgress { percent, .. } = event {
                assert!(percent >= last);
                last = percent;
            }
        }
        assert_eq!(last, 100);
    }
}
