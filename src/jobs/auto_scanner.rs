//! Automatic library rescans
//!
//! Filesystem events are debounced: the first event starts a wait, further
//! events during the wait extend it, and the scan runs once the library has
//! been quiet for a whole window.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::local_file::is_video_file;
use crate::services::scanner::{ScanError, ScanOptions, Scanner};

/// Something that rescans the library
#[async_trait]
pub trait ScanRunner: Send + Sync + 'static {
    async fn run_scan(&self) -> Result<()>;
}

#[async_trait]
impl ScanRunner for Scanner {
    async fn run_scan(&self) -> Result<()> {
        // Locked and ignored files are retained as-is by the scanner
        match self.scan(ScanOptions::default(), CancellationToken::new()).await {
            Ok(_) | Err(ScanError::NoLocalFiles) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct DebounceState {
    waiting: bool,
    missed: bool,
}

pub struct AutoScanner {
    runner: Arc<dyn ScanRunner>,
    window: Duration,
    state: Mutex<DebounceState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl AutoScanner {
    pub fn new(runner: Arc<dyn ScanRunner>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            runner,
            window,
            state: Mutex::new(DebounceState::default()),
            watcher: Mutex::new(None),
        })
    }

    /// Record a library change
    pub fn notify(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.waiting {
                state.missed = true;
                return;
            }
            state.waiting = true;
            state.missed = false;
        }
        debug!(window_secs = self.window.as_secs(), "Library change detected, waiting for quiet");
        tokio::spawn(self.clone().wait_and_scan());
    }

    async fn wait_and_scan(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.window).await;
            let mut state = self.state.lock();
            if state.missed {
                state.missed = false;
                continue;
            }
            // Changes during the scan start a new wait
            state.waiting = false;
            break;
        }

        info!("Running automatic library scan");
        let runner = self.runner.clone();
        // A panicking scan only takes down its own task
        match tokio::spawn(async move { runner.run_scan().await }).await {
            Ok(Ok(())) => info!("Automatic library scan finished"),
            Ok(Err(e)) => warn!(error = %e, "Automatic library scan failed"),
            Err(e) if e.is_panic() => error!("Automatic library scan panicked, recovered"),
            Err(e) => warn!(error = %e, "Automatic library scan aborted"),
        }
    }

    /// Watch `root` recursively until `cancel` fires
    pub fn watch(self: &Arc<Self>, root: &Path, cancel: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_library_change(&event) => {
                    debug!(paths = ?event.paths, kind = ?event.kind, "Library file changed");
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Library watch error"),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create library watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        *self.watcher.lock() = Some(watcher);
        info!(path = %root.display(), "Watching library for changes");

        let scanner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(()) => scanner.notify(),
                        None => break,
                    },
                }
            }
            scanner.watcher.lock().take();
            info!("Library watcher stopped");
        });
        Ok(())
    }
}

/// Creations, removals and renames of video files
fn is_library_change(event: &Event) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    relevant_kind && event.paths.iter().any(|p| is_video_file(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RenameMode};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRunner {
        scans: AtomicUsize,
        panic_next: AtomicBool,
    }

    #[async_trait]
    impl ScanRunner for CountingRunner {
        async fn run_scan(&self) -> Result<()> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("scan blew up");
            }
            Ok(())
        }
    }

    const WINDOW: Duration = Duration::from_secs(15);

    fn setup() -> (Arc<CountingRunner>, Arc<AutoScanner>) {
        let runner = Arc::new(CountingRunner::default());
        let scanner = AutoScanner::new(runner.clone(), WINDOW);
        (runner, scanner)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_triggers_one_scan() {
        let (runner, scanner) = setup();
        scanner.notify();
        scanner.notify();
        scanner.notify();

        // The burst itself counts as activity during the first window
        advance(16).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 0);

        advance(15).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 1);

        advance(60).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_event_extends_wait() {
        let (runner, scanner) = setup();
        scanner.notify();
        advance(10).await;
        scanner.notify();

        advance(10).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 0);

        advance(11).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_scan_is_recovered() {
        let (runner, scanner) = setup();
        runner.panic_next.store(true, Ordering::SeqCst);
        scanner.notify();
        advance(16).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 1);

        scanner.notify();
        advance(16).await;
        assert_eq!(runner.scans.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_only_video_changes_count() {
        let video = PathBuf::from("/lib/Frieren/ep01.mkv");
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(video.clone());
        assert!(is_library_change(&create));

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(video.clone());
        assert!(is_library_change(&rename));

        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(video);
        assert!(!is_library_change(&write));

        let subtitle = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/lib/Frieren/ep01.ass"));
        assert!(!is_library_change(&subtitle));
    }
}
