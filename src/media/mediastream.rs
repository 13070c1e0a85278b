//! Media containers and the stream repository
//!
//! A `MediaContainer` describes the file a client asked to watch and how it
//! will be served. The repository keeps the current container, owns the
//! transcoder and resolves subtitle and attachment requests.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::attachments;
use super::media_info::{MediaInfo, MediaInfoExtractor};
use super::transcoder::{TranscodeError, Transcoder, TranscoderSettings};
use crate::config::Config;
use crate::services::events::{ClientEvent, EventBus};
use crate::services::library_store::LibraryStore;

pub const DIRECT_URL: &str = "/api/mediastream/direct";
pub const TRANSCODE_URL: &str = "/api/mediastream/transcode/master.m3u8";

/// Extension of pre-transcoded derivatives
const OPTIMIZED_EXTENSION: &str = "mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// The source file, byte ranges
    Direct,
    /// HLS produced on the fly
    Transcode,
    /// A derivative from the pre-transcoded library
    Optimized,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Direct => "direct",
            StreamType::Transcode => "transcode",
            StreamType::Optimized => "optimized",
        }
    }

    pub fn stream_url(&self) -> &'static str {
        match self {
            StreamType::Transcode => TRANSCODE_URL,
            StreamType::Direct | StreamType::Optimized => DIRECT_URL,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(StreamType::Direct),
            "transcode" => Ok(StreamType::Transcode),
            "optimized" => Ok(StreamType::Optimized),
            _ => Err(TranscodeError::InvalidPath),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContainer {
    /// File actually served. For `optimized` this is the derivative.
    pub filepath: String,
    pub hash: String,
    pub stream_type: StreamType,
    pub stream_url: String,
    pub media_info: MediaInfo,
    /// Matched media of the source file, when the scanner knows it
    pub media_id: Option<i32>,
}

pub struct MediastreamOptions {
    pub library_path: PathBuf,
    pub cache_dir: PathBuf,
    pub pre_transcode_path: Option<PathBuf>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub transcoder: TranscoderSettings,
}

impl MediastreamOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            library_path: config.library_path.clone(),
            cache_dir: config.cache_path.clone(),
            pre_transcode_path: config.pre_transcode_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            transcoder: TranscoderSettings::from_config(config),
        }
    }
}

pub struct MediastreamRepository {
    options: MediastreamOptions,
    extractor: MediaInfoExtractor,
    transcoder: RwLock<Option<Arc<Transcoder>>>,
    current: RwLock<Option<Arc<MediaContainer>>>,
    store: Arc<LibraryStore>,
    events: EventBus,
}

impl MediastreamRepository {
    pub fn new(options: MediastreamOptions, store: Arc<LibraryStore>, events: EventBus) -> Self {
        Self {
            extractor: MediaInfoExtractor::new(options.ffprobe_path.clone(), options.cache_dir.clone()),
            options,
            transcoder: RwLock::new(None),
            current: RwLock::new(None),
            store,
            events,
        }
    }

    /// Start a fresh transcoder. Failures leave the module uninitialized
    /// and are reported to clients when they try to stream.
    pub async fn init_transcoder(&self) -> bool {
        match Transcoder::new(self.options.transcoder.clone()).await {
            Ok(transcoder) => {
                *self.transcoder.write() = Some(Arc::new(transcoder));
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize transcoder");
                false
            }
        }
    }

    pub fn is_transcoder_ready(&self) -> bool {
        self.transcoder.read().is_some()
    }

    pub fn transcoder(&self) -> Result<Arc<Transcoder>, TranscodeError> {
        let transcoder = self.transcoder.read().clone();
        transcoder.ok_or_else(|| {
            self.shutdown_event("Module not initialized");
            TranscodeError::NotInitialized
        })
    }

    pub fn current_container(&self) -> Result<Arc<MediaContainer>, TranscodeError> {
        let current = self.current.read().clone();
        current.ok_or_else(|| {
            self.shutdown_event("No media has been requested");
            TranscodeError::NoMediaRequested
        })
    }

    fn shutdown_event(&self, reason: &str) {
        self.events.send(ClientEvent::MediastreamShutdownStream {
            reason: reason.to_string(),
        });
    }

    /// Probe the file and make it the current container
    pub async fn request_media_container(
        &self,
        path: &str,
        stream_type: StreamType,
    ) -> Result<Arc<MediaContainer>, TranscodeError> {
        let source = Path::new(path);
        if !source.is_file() {
            return Err(TranscodeError::InvalidPath);
        }

        let filepath = match stream_type {
            StreamType::Optimized => self.optimized_path(source)?,
            StreamType::Direct | StreamType::Transcode => source.to_path_buf(),
        };

        let media_info = self
            .extractor
            .get_info(&filepath)
            .await
            .map_err(|e| TranscodeError::Probe(format!("{e:#}")))?;

        let container = Arc::new(MediaContainer {
            filepath: filepath.to_string_lossy().into_owned(),
            hash: media_info.sha.clone(),
            stream_type,
            stream_url: stream_type.stream_url().to_string(),
            media_id: self
                .store
                .find(path)
                .filter(|f| f.is_matched())
                .map(|f| f.media_id),
            media_info,
        });

        if stream_type == StreamType::Transcode {
            let ffmpeg = self.options.ffmpeg_path.clone();
            let cache_dir = self.options.cache_dir.clone();
            let info = container.media_info.clone();
            tokio::spawn(async move {
                if let Err(e) = attachments::extract(&ffmpeg, &cache_dir, &info).await {
                    warn!(path = %info.path, error = %e, "Failed to extract attachments");
                }
            });
        }

        info!(
            path = %container.filepath,
            stream_type = %stream_type,
            media_id = ?container.media_id,
            "Media container requested"
        );
        *self.current.write() = Some(container.clone());
        Ok(container)
    }

    /// Container for a transcode request: the `file` query when given,
    /// otherwise the current container
    pub async fn container_for(&self, file: Option<&str>) -> Result<Arc<MediaContainer>, TranscodeError> {
        let Some(file) = file.filter(|f| !f.is_empty()) else {
            return self.current_container();
        };
        let current = self.current.read().clone();
        if let Some(current) = current.filter(|c| c.filepath == file) {
            return Ok(current);
        }
        self.request_media_container(file, StreamType::Transcode).await
    }

    /// Derivative of `source` in the pre-transcoded library, mirroring its
    /// place under the library root
    fn optimized_path(&self, source: &Path) -> Result<PathBuf, TranscodeError> {
        let Some(root) = &self.options.pre_transcode_path else {
            return Err(TranscodeError::InvalidPath);
        };
        let relative = source
            .strip_prefix(&self.options.library_path)
            .ok()
            .map(Path::to_path_buf)
            .or_else(|| source.file_name().map(PathBuf::from))
            .ok_or(TranscodeError::InvalidPath)?;
        let derivative = root.join(relative).with_extension(OPTIMIZED_EXTENSION);
        if !derivative.is_file() {
            debug!(path = %derivative.display(), "No optimized derivative");
            return Err(TranscodeError::InvalidPath);
        }
        Ok(derivative)
    }

    /// Stop transcoding for the current container and start over with a
    /// fresh transcoder
    pub async fn shutdown_transcode_stream(&self) {
        if self.current.read().is_none() {
            return;
        }
        let Some(transcoder) = self.transcoder.write().take() else {
            return;
        };
        transcoder.shutdown();
        *self.current.write() = None;
        self.init_transcoder().await;
        info!("Transcode stream shut down");
        self.events.send(ClientEvent::MediastreamShutdownStream {
            reason: String::new(),
        });
    }

    pub fn subtitle_path(&self, name: &str) -> Result<PathBuf, TranscodeError> {
        let container = self.current_container()?;
        let dir = attachments::subtitles_dir(&self.options.cache_dir, &container.hash);
        attachments::resolve_in(&dir, name).ok_or(TranscodeError::InvalidPath)
    }

    pub fn attachment_path(&self, name: &str) -> Result<PathBuf, TranscodeError> {
        let container = self.current_container()?;
        let dir = attachments::attachments_dir(&self.options.cache_dir, &container.hash);
        attachments::resolve_in(&dir, name).ok_or(TranscodeError::InvalidPath)
    }

    /// Shut down the transcoder for good
    pub fn shutdown(&self) {
        let transcoder = self.transcoder.write().take();
        if let Some(transcoder) = transcoder {
            transcoder.shutdown();
            self.shutdown_event("Transcoder stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::media_info::file_hash;
    use crate::media::transcoder::{HwAccelKind, HwAccelSettings};
    use assert_matches::assert_matches;

    struct Fixture {
        dir: tempfile::TempDir,
        repo: MediastreamRepository,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let store = Arc::new(LibraryStore::open(dir.path().join("data")).await.unwrap());
        let events = EventBus::default();
        let options = MediastreamOptions {
            library_path: library,
            cache_dir: dir.path().join("cache"),
            pre_transcode_path: Some(dir.path().join("optimized")),
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ffprobe_path: "/nonexistent/ffprobe".into(),
            transcoder: TranscoderSettings {
                stream_dir: dir.path().join("transcode").join("streams"),
                ffmpeg_path: "/nonexistent/ffmpeg".into(),
                ffprobe_path: "/nonexistent/ffprobe".into(),
                hwaccel: HwAccelSettings::new(HwAccelKind::Disabled, "fast", ""),
            },
        };
        let repo = MediastreamRepository::new(options, store, events.clone());
        Fixture { dir, repo, events }
    }

    /// Write a video file and a cached probe result for it
    fn seed_file(fixture: &Fixture, path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"video").unwrap();
        let hash = file_hash(path).unwrap();
        let info = MediaInfo {
            sha: hash.clone(),
            path: path.to_string_lossy().into_owned(),
            extension: "mkv".into(),
            mime_codec: None,
            size: 5,
            duration: 1420.0,
            container: Some("matroska,webm".into()),
            video: None,
            videos: Vec::new(),
            audios: Vec::new(),
            subtitles: Vec::new(),
            fonts: Vec::new(),
            chapters: Vec::new(),
        };
        let cache = fixture.dir.path().join("cache").join(&hash);
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("info.json"), serde_json::to_vec(&info).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_direct_container() {
        let fixture = fixture().await;
        let path = fixture.dir.path().join("library/Frieren/ep01.mkv");
        seed_file(&fixture, &path);

        let container = fixture
            .repo
            .request_media_container(&path.to_string_lossy(), StreamType::Direct)
            .await
            .unwrap();
        assert_eq!(container.stream_url, DIRECT_URL);
        assert_eq!(container.media_id, None);
        assert_eq!(container.media_info.duration, 1420.0);

        let current = fixture.repo.current_container().unwrap();
        assert_eq!(current.hash, container.hash);
    }

    #[tokio::test]
    async fn test_optimized_uses_derivative() {
        let fixture = fixture().await;
        let source = fixture.dir.path().join("library/Frieren/ep01.mkv");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"source").unwrap();

        assert_matches!(
            fixture
                .repo
                .request_media_container(&source.to_string_lossy(), StreamType::Optimized)
                .await,
            Err(TranscodeError::InvalidPath)
        );

        let derivative = fixture.dir.path().join("optimized/Frieren/ep01.mp4");
        seed_file(&fixture, &derivative);
        let container = fixture
            .repo
            .request_media_container(&source.to_string_lossy(), StreamType::Optimized)
            .await
            .unwrap();
        assert_eq!(PathBuf::from(&container.filepath), derivative);
        assert_eq!(container.stream_url, DIRECT_URL);
    }

    #[tokio::test]
    async fn test_missing_container_notifies_clients() {
        let fixture = fixture().await;
        let mut rx = fixture.events.subscribe();

        assert_matches!(fixture.repo.current_container(), Err(TranscodeError::NoMediaRequested));
        assert_matches!(
            rx.recv().await.unwrap(),
            ClientEvent::MediastreamShutdownStream { reason } if reason == "No media has been requested"
        );

        assert_matches!(fixture.repo.transcoder(), Err(TranscodeError::NotInitialized));
        assert!(fixture.repo.init_transcoder().await);
        assert!(fixture.repo.transcoder().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_file_is_invalid() {
        let fixture = fixture().await;
        assert_matches!(
            fixture
                .repo
                .request_media_container("/nonexistent/ep01.mkv", StreamType::Transcode)
                .await,
            Err(TranscodeError::InvalidPath)
        );
        assert_matches!(fixture.repo.subtitle_path("0.ass"), Err(TranscodeError::NoMediaRequested));
    }

    #[test]
    fn test_stream_type_urls() {
        assert_eq!("Transcode".parse::<StreamType>().unwrap().stream_url(), TRANSCODE_URL);
        assert_eq!(StreamType::Optimized.to_string(), "optimized");
    }
}
