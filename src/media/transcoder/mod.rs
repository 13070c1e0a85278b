//! On-the-fly HLS transcoder
//!
//! Files are split into segments at video keyframes. Each requested
//! rendition runs ffmpeg "heads" over ranges of segments, starting new ones
//! when a client seeks away from every running encoder. A tracker task
//! follows clients and stops encoders nobody is watching.

pub mod audio_stream;
pub mod file_stream;
pub mod hwaccel;
pub mod keyframes;
pub mod quality;
pub mod settings;
pub mod stream;
pub mod tracker;
pub mod video_stream;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

pub use file_stream::FileStream;
pub use hwaccel::{HwAccelKind, HwAccelSettings};
pub use quality::Quality;
pub use settings::TranscoderSettings;
pub use tracker::ClientInfo;

use crate::media::media_info::MediaInfo;
use tracker::{StreamControl, Tracker};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid path")]
    InvalidPath,

    #[error("no media has been requested")]
    NoMediaRequested,

    #[error("module not initialized")]
    NotInitialized,

    #[error("segment {0} was not ready in time")]
    SegmentTimeout(usize),

    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),

    #[error("unknown quality: {0}")]
    UnknownQuality(String),

    #[error("unknown audio track: {0}")]
    UnknownAudio(usize),

    #[error("stream stopped while waiting for segment {0}")]
    StreamKilled(usize),

    #[error("could not read media info: {0}")]
    Probe(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type FileStreamCell = Arc<OnceCell<Arc<FileStream>>>;

/// File streams by source path. Creation is single-flight per path.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, FileStreamCell>>,
}

impl StreamRegistry {
    pub async fn get_or_create(
        &self,
        path: &str,
        info: &MediaInfo,
        settings: &Arc<TranscoderSettings>,
    ) -> Result<Arc<FileStream>, TranscodeError> {
        let cell = self.streams.lock().entry(path.to_string()).or_default().clone();
        let stream = cell
            .get_or_try_init(|| {
                FileStream::new(Path::new(path), Arc::new(info.clone()), settings.clone())
            })
            .await?;
        Ok(stream.clone())
    }

    pub fn get(&self, path: &str) -> Option<Arc<FileStream>> {
        self.streams.lock().get(path).and_then(|c| c.get().cloned())
    }

    fn remove(&self, path: &str) -> Option<Arc<FileStream>> {
        self.streams.lock().remove(path).and_then(|c| c.get().cloned())
    }

    fn all(&self) -> Vec<Arc<FileStream>> {
        self.streams
            .lock()
            .values()
            .filter_map(|c| c.get().cloned())
            .collect()
    }
}

#[async_trait]
impl StreamControl for StreamRegistry {
    fn kill_file(&self, path: &str) -> bool {
        match self.get(path) {
            Some(stream) => {
                stream.kill();
                true
            }
            None => false,
        }
    }

    async fn destroy_file(&self, path: &str) {
        if let Some(stream) = self.remove(path) {
            stream.destroy().await;
        }
    }

    fn kill_quality(&self, path: &str, quality: Quality) {
        if let Some(stream) = self.get(path) {
            stream.kill_quality(quality);
        }
    }

    fn kill_audio(&self, path: &str, audio: usize) {
        if let Some(stream) = self.get(path) {
            stream.kill_audio(audio);
        }
    }

    fn kill_orphaned_heads(
        &self,
        path: &str,
        quality: Option<Quality>,
        audio: Option<usize>,
        client_heads: &[usize],
    ) {
        if let Some(stream) = self.get(path) {
            stream.kill_orphaned_heads(quality, audio, client_heads);
        }
    }
}

pub struct Transcoder {
    settings: Arc<TranscoderSettings>,
    registry: Arc<StreamRegistry>,
    tracker: Tracker,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Transcoder {
    /// Start with an empty stream directory. Must run inside a tokio runtime.
    pub async fn new(settings: TranscoderSettings) -> Result<Self> {
        match tokio::fs::remove_dir_all(&settings.stream_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to clear {}", settings.stream_dir.display())
                });
            }
        }
        tokio::fs::create_dir_all(&settings.stream_dir)
            .await
            .with_context(|| format!("Failed to create {}", settings.stream_dir.display()))?;

        info!(
            dir = %settings.stream_dir.display(),
            hwaccel = %settings.hwaccel.kind,
            "Transcoder initialized"
        );

        let registry = Arc::new(StreamRegistry::default());
        Ok(Self {
            settings: Arc::new(settings),
            tracker: Tracker::spawn(registry.clone()),
            registry,
        })
    }

    pub fn settings(&self) -> &TranscoderSettings {
        &self.settings
    }

    /// Hashes of files with live streams
    pub fn active_hashes(&self) -> Vec<String> {
        self.registry
            .all()
            .iter()
            .map(|s| s.info.sha.clone())
            .collect()
    }

    async fn file(&self, path: &str, info: &MediaInfo) -> Result<Arc<FileStream>, TranscodeError> {
        self.registry.get_or_create(path, info, &self.settings).await
    }

    pub async fn get_master(
        &self,
        path: &str,
        info: &MediaInfo,
        client: &str,
    ) -> Result<String, TranscodeError> {
        let stream = self.file(path, info).await?;
        self.tracker.track(ClientInfo::new(client, path));
        Ok(stream.master())
    }

    pub async fn get_video_index(
        &self,
        path: &str,
        info: &MediaInfo,
        quality: Quality,
        client: &str,
    ) -> Result<String, TranscodeError> {
        let stream = self.file(path, info).await?;
        self.tracker
            .track(ClientInfo::new(client, path).with_quality(quality));
        stream.video_index(quality)
    }

    pub async fn get_audio_index(
        &self,
        path: &str,
        info: &MediaInfo,
        audio: usize,
        client: &str,
    ) -> Result<String, TranscodeError> {
        let stream = self.file(path, info).await?;
        self.tracker.track(ClientInfo::new(client, path).with_audio(audio));
        stream.audio_index(audio)
    }

    pub async fn get_video_segment(
        &self,
        path: &str,
        info: &MediaInfo,
        quality: Quality,
        segment: usize,
        client: &str,
    ) -> Result<PathBuf, TranscodeError> {
        let stream = self.file(path, info).await?;
        self.tracker.track(
            ClientInfo::new(client, path)
                .with_quality(quality)
                .with_head(segment),
        );
        stream.video_segment(quality, segment).await
    }

    pub async fn get_audio_segment(
        &self,
        path: &str,
        info: &MediaInfo,
        audio: usize,
        segment: usize,
        client: &str,
    ) -> Result<PathBuf, TranscodeError> {
        let stream = self.file(path, info).await?;
        self.tracker.track(
            ClientInfo::new(client, path)
                .with_audio(audio)
                .with_head(segment),
        );
        stream.audio_segment(audio, segment).await
    }

    /// Kill every encoder and stop tracking. Output stays on disk until the
    /// next start clears the stream directory.
    pub fn shutdown(&self) {
        self.tracker.stop();
        for stream in self.registry.all() {
            stream.kill();
        }
        info!("Transcoder shut down");
    }
}

/// Segment number from a `segment-{n}.ts` request
pub fn parse_segment(name: &str) -> Result<usize, TranscodeError> {
    name.strip_prefix("segment-")
        .and_then(|s| s.strip_suffix(".ts"))
        .and_then(|n| n.parse().ok())
        .ok_or(TranscodeError::InvalidPath)
}
