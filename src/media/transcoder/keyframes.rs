//! Keyframe analysis
//!
//! Keyframes bound the segments: segment `i` spans `[kf[i], kf[i+1])` and the
//! last one runs to the end of the file. Extraction streams results in; the
//! first batch unblocks readers and later batches are pushed to listeners.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Keyframes needed before playlists can be served
const READY_BATCH: usize = 100;

/// Keyframes buffered before listeners are told
const APPEND_BATCH: usize = 500;

/// Segment length used when a file has no usable video track
const SYNTHETIC_SEGMENT_SECS: f64 = 2.0;

pub const KEYFRAMES_FILE: &str = "keyframes.json";

type Listener = Arc<dyn Fn(&[f64]) + Send + Sync>;

#[derive(Default)]
struct KeyframeState {
    keyframes: Vec<f64>,
    done: bool,
    listeners: Vec<Listener>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedKeyframes {
    keyframes: Vec<f64>,
    is_done: bool,
}

pub struct Keyframes {
    state: Mutex<KeyframeState>,
    ready: watch::Sender<bool>,
}

impl Default for Keyframes {
    fn default() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Mutex::new(KeyframeState::default()),
            ready,
        }
    }
}

impl Keyframes {
    /// A complete list, usable right away
    pub fn complete(keyframes: Vec<f64>) -> Self {
        let kf = Self::default();
        {
            let mut state = kf.state.lock();
            state.keyframes = keyframes;
            state.done = true;
        }
        kf.ready.send_replace(true);
        kf
    }

    /// Uniform grid over `duration`
    pub fn synthetic(duration: f64) -> Self {
        Self::complete(uniform_grid(duration))
    }

    pub fn get(&self, index: usize) -> f64 {
        let state = self.state.lock();
        state.keyframes.get(index).copied().unwrap_or_else(|| {
            state.keyframes.last().copied().unwrap_or(0.0)
        })
    }

    /// Keyframes in `[start, end)`, clamped to what is known
    pub fn slice(&self, start: usize, end: usize) -> Vec<f64> {
        let state = self.state.lock();
        let end = end.min(state.keyframes.len());
        if start >= end {
            return Vec::new();
        }
        state.keyframes[start..end].to_vec()
    }

    /// Known keyframe count and whether extraction finished
    pub fn length(&self) -> (usize, bool) {
        let state = self.state.lock();
        (state.keyframes.len(), state.done)
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Called with the full list after every append
    pub fn add_listener(&self, listener: impl Fn(&[f64]) + Send + Sync + 'static) {
        self.state.lock().listeners.push(Arc::new(listener));
    }

    pub fn append(&self, keyframes: &[f64]) {
        if keyframes.is_empty() {
            return;
        }
        let (snapshot, listeners) = {
            let mut state = self.state.lock();
            state.keyframes.extend_from_slice(keyframes);
            (state.keyframes.clone(), state.listeners.clone())
        };
        // Listeners take stream locks; never call them under ours
        for listener in listeners {
            listener(&snapshot);
        }
        if snapshot.len() >= READY_BATCH {
            self.ready.send_replace(true);
        }
    }

    pub fn mark_done(&self) {
        self.state.lock().done = true;
        self.ready.send_replace(true);
    }

    /// Wait until the first batch is in or extraction finished
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    async fn persist(&self, path: &Path) -> Result<()> {
        let persisted = {
            let state = self.state.lock();
            PersistedKeyframes {
                keyframes: state.keyframes.clone(),
                is_done: state.done,
            }
        };
        let json = serde_json::to_vec(&persisted)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

pub fn uniform_grid(duration: f64) -> Vec<f64> {
    let count = (duration / SYNTHETIC_SEGMENT_SECS).ceil().max(1.0) as usize;
    (0..count).map(|i| i as f64 * SYNTHETIC_SEGMENT_SECS).collect()
}

/// Parse one `pts_time,flags` line; `Some` only for keyframes
fn parse_packet_line(line: &str) -> Option<f64> {
    let (pts, flags) = line.trim().split_once(',')?;
    if !flags.starts_with('K') {
        return None;
    }
    pts.parse::<f64>().ok()
}

/// Load persisted keyframes, or start extracting them in the background.
/// Returns once the first batch is available.
pub async fn load_or_extract(
    ffprobe_path: &str,
    path: &Path,
    out_dir: &Path,
    duration: f64,
    has_video: bool,
) -> Arc<Keyframes> {
    let cache = out_dir.join(KEYFRAMES_FILE);
    if let Ok(bytes) = tokio::fs::read(&cache).await {
        if let Ok(persisted) = serde_json::from_slice::<PersistedKeyframes>(&bytes) {
            if persisted.is_done && !persisted.keyframes.is_empty() {
                debug!(path = %cache.display(), count = persisted.keyframes.len(), "Keyframes loaded from disk");
                return Arc::new(Keyframes::complete(persisted.keyframes));
            }
        }
    }

    if !has_video {
        debug!(path = %path.display(), "No video track, using a synthetic keyframe grid");
        return Arc::new(Keyframes::synthetic(duration));
    }

    let keyframes = Arc::new(Keyframes::default());
    let task_kf = keyframes.clone();
    let ffprobe = ffprobe_path.to_string();
    let file = path.to_path_buf();
    tokio::spawn(async move {
        if let Err(e) = extract(&ffprobe, &file, &task_kf).await {
            warn!(path = %file.display(), error = %e, "Keyframe extraction failed, using a synthetic grid");
            let (known, _) = task_kf.length();
            let last = if known == 0 {
                f64::NEG_INFINITY
            } else {
                task_kf.get(known - 1)
            };
            let grid: Vec<f64> = uniform_grid(duration)
                .into_iter()
                .filter(|t| *t > last)
                .collect();
            task_kf.append(&grid);
        }
        task_kf.mark_done();
        if let Err(e) = tokio::fs::create_dir_all(cache_parent(&cache)).await {
            warn!(error = %e, "Failed to create stream directory");
            return;
        }
        if let Err(e) = task_kf.persist(&cache).await {
            warn!(error = %e, "Failed to persist keyframes");
        }
    });

    keyframes.wait_ready().await;
    keyframes
}

fn cache_parent(cache: &Path) -> PathBuf {
    cache.parent().map(Path::to_path_buf).unwrap_or_default()
}

async fn extract(ffprobe_path: &str, path: &Path, keyframes: &Keyframes) -> Result<()> {
    info!(path = %path.display(), "Extracting keyframes");
    let mut child = Command::new(ffprobe_path)
        .args(["-loglevel", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "packet=pts_time,flags"])
        .args(["-of", "csv=print_section=0"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to start ffprobe")?;

    let stdout = child.stdout.take().context("ffprobe has no stdout")?;
    let mut lines = BufReader::new(stdout).lines();
    let mut batch = Vec::with_capacity(READY_BATCH);
    let mut total = 0usize;
    let mut limit = READY_BATCH;

    while let Some(line) = lines.next_line().await? {
        let Some(mut pts) = parse_packet_line(&line) else {
            continue;
        };
        // Segment 0 always starts at the beginning of the file
        if total == 0 && batch.is_empty() {
            pts = 0.0;
        }
        batch.push(pts);
        if batch.len() >= limit {
            total += batch.len();
            keyframes.append(&batch);
            batch.clear();
            limit = APPEND_BATCH;
        }
    }
    total += batch.len();
    keyframes.append(&batch);

    let status = child.wait().await.context("ffprobe did not exit")?;
    if !status.success() {
        bail!("ffprobe exited with {status}");
    }
    if total == 0 {
        bail!("no keyframes found");
    }
    info!(path = %path.display(), count = total, "Keyframes extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_packet_line() {
        assert_eq!(parse_packet_line("12.512000,K__"), Some(12.512));
        assert_eq!(parse_packet_line("12.554000,___"), None);
        assert_eq!(parse_packet_line("N/A,K__"), None);
        assert_eq!(parse_packet_line("garbage"), None);
    }

    #[test]
    fn test_uniform_grid() {
        assert_eq!(uniform_grid(7.0), vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(uniform_grid(0.0), vec![0.0]);
    }

    #[test]
    fn test_listeners_see_appends() {
        let kf = Keyframes::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        kf.add_listener(move |all| counter.store(all.len(), Ordering::SeqCst));

        kf.append(&[0.0, 4.0]);
        kf.append(&[8.0]);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(kf.slice(1, 10), vec![4.0, 8.0]);
        assert_eq!(kf.length(), (3, false));
    }

    #[tokio::test]
    async fn test_persisted_keyframes_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let persisted = PersistedKeyframes {
            keyframes: vec![0.0, 5.0, 10.0],
            is_done: true,
        };
        std::fs::write(
            dir.path().join(KEYFRAMES_FILE),
            serde_json::to_vec(&persisted).unwrap(),
        )
        .unwrap();

        let kf = load_or_extract(
            "/nonexistent/ffprobe",
            Path::new("/lib/video.mkv"),
            dir.path(),
            20.0,
            true,
        )
        .await;
        assert_eq!(kf.length(), (3, true));
        assert_eq!(kf.get(1), 5.0);
    }

    #[tokio::test]
    async fn test_failed_probe_falls_back_to_grid() {
        let dir = tempfile::tempdir().unwrap();
        let kf = load_or_extract(
            "/nonexistent/ffprobe",
            Path::new("/lib/video.mkv"),
            dir.path(),
            6.0,
            true,
        )
        .await;
        assert!(kf.is_done());
        assert_eq!(kf.slice(0, 10), vec![0.0, 2.0, 4.0]);
    }
}
