//! Per-file aggregate of renditions
//!
//! A `FileStream` owns the keyframes of one source file and lazily creates a
//! [`Stream`] per requested quality or audio track. All of them write into the
//! same output directory, named after the file hash.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::audio_stream::AudioStream;
use super::hwaccel::HwAccelSettings;
use super::keyframes::{self, Keyframes};
use super::quality::{QUALITIES, Quality};
use super::settings::TranscoderSettings;
use super::stream::Stream;
use super::video_stream::VideoStream;
use super::TranscodeError;
use crate::media::media_info::MediaInfo;

/// Codec advertised for transcoded renditions; the level is appended
const TRANSCODE_CODEC_PREFIX: &str = "avc1.6400";
const TRANSCODE_CODEC: &str = "avc1.640028";

pub struct FileStream {
    path: PathBuf,
    out_dir: PathBuf,
    pub info: Arc<MediaInfo>,
    keyframes: Arc<Keyframes>,
    settings: Arc<TranscoderSettings>,
    hwaccel: Arc<HwAccelSettings>,
    videos: Mutex<HashMap<Quality, Arc<Stream>>>,
    audios: Mutex<HashMap<usize, Arc<Stream>>>,
}

impl FileStream {
    /// Prepare the output directory and keyframes. Returns once the first
    /// keyframe batch is known.
    pub async fn new(
        path: &Path,
        info: Arc<MediaInfo>,
        settings: Arc<TranscoderSettings>,
    ) -> Result<Arc<Self>, TranscodeError> {
        let out_dir = settings.file_dir(&info.sha);
        tokio::fs::create_dir_all(&out_dir).await?;

        let keyframes = keyframes::load_or_extract(
            &settings.ffprobe_path,
            path,
            &out_dir,
            info.duration,
            info.video.is_some(),
        )
        .await;

        info!(
            path = %path.display(),
            hash = %info.sha,
            keyframes = keyframes.length().0,
            "File stream ready"
        );

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            out_dir,
            hwaccel: Arc::new(settings.hwaccel.clone()),
            info,
            keyframes,
            settings,
            videos: Mutex::new(HashMap::new()),
            audios: Mutex::new(HashMap::new()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Multi-bitrate master playlist
    pub fn master(&self) -> String {
        let mut master = String::from("#EXTM3U\n#EXT-X-VERSION:6\n");
        let audio_group = if self.info.audios.is_empty() {
            ""
        } else {
            "AUDIO=\"audio\","
        };

        if let Some(video) = &self.info.video {
            // First quality the source would not fill, used to cap the
            // bandwidth advertised for passthrough
            let transmux = QUALITIES
                .iter()
                .copied()
                .find(|q| q.height() >= video.height || q.average_bitrate() >= video.bitrate)
                .unwrap_or(Quality::P8k);
            let bitrate = video.bitrate as f64;

            let _ = write!(
                master,
                "#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH={},BANDWIDTH={},RESOLUTION={}x{},",
                (bitrate * 0.8).min(transmux.average_bitrate() as f64) as u64,
                bitrate.min(transmux.max_bitrate() as f64) as u64,
                video.width,
                video.height,
            );
            if let Some(codec) = &video.mime_codec {
                let _ = write!(master, "CODECS=\"{codec}\",");
            }
            let _ = write!(
                master,
                "{audio_group}CLOSED-CAPTIONS=NONE\n./{}/index.m3u8\n",
                Quality::Original
            );

            let aspect_ratio = if video.height == 0 {
                16.0 / 9.0
            } else {
                video.width as f64 / video.height as f64
            };
            let same_codec = video
                .mime_codec
                .as_deref()
                .is_some_and(|c| c.starts_with(TRANSCODE_CODEC_PREFIX));

            for quality in QUALITIES {
                let height = quality.height();
                let offered = height < video.quality.height()
                    || (height == video.quality.height() && !same_codec);
                if !offered {
                    continue;
                }
                let _ = write!(
                    master,
                    "#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH={},BANDWIDTH={},RESOLUTION={}x{height},\
                     CODECS=\"{TRANSCODE_CODEC}\",{audio_group}CLOSED-CAPTIONS=NONE\n\
                     ./{quality}/index.m3u8\n",
                    quality.average_bitrate(),
                    quality.max_bitrate(),
                    (aspect_ratio * height as f64).round() as u32,
                );
            }
        }

        let default_audio = self
            .info
            .audios
            .iter()
            .position(|a| a.is_default)
            .unwrap_or(0);
        for (position, audio) in self.info.audios.iter().enumerate() {
            master.push_str("#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",");
            if let Some(language) = &audio.language {
                let _ = write!(master, "LANGUAGE=\"{language}\",");
            }
            let name = audio
                .title
                .clone()
                .or_else(|| audio.language.clone())
                .unwrap_or_else(|| format!("Audio {}", audio.index));
            let _ = write!(master, "NAME=\"{name}\",");
            if position == default_audio {
                master.push_str("DEFAULT=YES,");
            }
            let _ = writeln!(
                master,
                "CHANNELS=\"2\",URI=\"./audio/{}/index.m3u8\"",
                audio.index
            );
        }
        master
    }

    fn video(&self, quality: Quality) -> Result<Arc<Stream>, TranscodeError> {
        let Some(source) = &self.info.video else {
            return Err(TranscodeError::UnknownQuality(quality.to_string()));
        };
        let mut videos = self.videos.lock();
        let stream = videos.entry(quality).or_insert_with(|| {
            debug!(path = %self.path.display(), quality = %quality, "Creating video stream");
            Stream::new(
                Box::new(VideoStream::new(quality, source.clone(), self.hwaccel.clone())),
                self.path.clone(),
                self.out_dir.clone(),
                self.info.duration,
                self.keyframes.clone(),
                self.settings.clone(),
            )
        });
        Ok(stream.clone())
    }

    fn audio(&self, audio: usize) -> Result<Arc<Stream>, TranscodeError> {
        if !self.info.audios.iter().any(|a| a.index == audio) {
            return Err(TranscodeError::UnknownAudio(audio));
        }
        let mut audios = self.audios.lock();
        let stream = audios.entry(audio).or_insert_with(|| {
            debug!(path = %self.path.display(), audio, "Creating audio stream");
            Stream::new(
                Box::new(AudioStream::new(audio)),
                self.path.clone(),
                self.out_dir.clone(),
                self.info.duration,
                self.keyframes.clone(),
                self.settings.clone(),
            )
        });
        Ok(stream.clone())
    }

    pub fn video_index(&self, quality: Quality) -> Result<String, TranscodeError> {
        Ok(self.video(quality)?.index())
    }

    pub fn audio_index(&self, audio: usize) -> Result<String, TranscodeError> {
        Ok(self.audio(audio)?.index())
    }

    pub async fn video_segment(
        &self,
        quality: Quality,
        segment: usize,
    ) -> Result<PathBuf, TranscodeError> {
        self.video(quality)?.get_segment(segment).await
    }

    pub async fn audio_segment(&self, audio: usize, segment: usize) -> Result<PathBuf, TranscodeError> {
        self.audio(audio)?.get_segment(segment).await
    }

    /// Stop every encoder, keeping output on disk
    pub fn kill(&self) {
        for stream in self.videos.lock().values() {
            stream.kill();
        }
        for stream in self.audios.lock().values() {
            stream.kill();
        }
    }

    /// Stop every encoder and remove the output directory
    pub async fn destroy(&self) {
        self.kill();
        self.videos.lock().clear();
        self.audios.lock().clear();
        match tokio::fs::remove_dir_all(&self.out_dir).await {
            Ok(()) => info!(path = %self.path.display(), "Transcode output removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.out_dir.display(), error = %e, "Failed to remove transcode output"),
        }
    }

    pub fn kill_quality(&self, quality: Quality) {
        if let Some(stream) = self.videos.lock().get(&quality) {
            stream.kill();
        }
    }

    pub fn kill_audio(&self, audio: usize) {
        if let Some(stream) = self.audios.lock().get(&audio) {
            stream.kill();
        }
    }

    pub fn kill_orphaned_heads(&self, quality: Option<Quality>, audio: Option<usize>, client_heads: &[usize]) {
        if let Some(stream) = quality.and_then(|q| self.videos.lock().get(&q).cloned()) {
            stream.kill_orphaned_heads(client_heads);
        }
        if let Some(stream) = audio.and_then(|a| self.audios.lock().get(&a).cloned()) {
            stream.kill_orphaned_heads(client_heads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::media_info::{Audio, Video};
    use crate::media::transcoder::hwaccel::HwAccelKind;
    use assert_matches::assert_matches;

    fn audio(index: usize, language: &str, is_default: bool) -> Audio {
        Audio {
            index,
            title: None,
            language: Some(language.to_string()),
            codec: "aac".into(),
            mime_codec: Some("mp4a.40.2".into()),
            is_default,
            is_forced: false,
            channels: 2,
        }
    }

    fn info(video: Option<Video>) -> MediaInfo {
        MediaInfo {
            sha: "0123456789abcdef0123456789abcdef01234567".into(),
            path: "/lib/video.mkv".into(),
            extension: "mkv".into(),
            mime_codec: None,
            size: 0,
            duration: 9.0,
            container: None,
            video: video.clone(),
            videos: video.into_iter().collect(),
            audios: vec![audio(0, "jpn", false), audio(1, "eng", true)],
            subtitles: Vec::new(),
            fonts: Vec::new(),
            chapters: Vec::new(),
        }
    }

    fn video_720p() -> Video {
        Video {
            codec: "h264".into(),
            mime_codec: Some("avc1.64001f".into()),
            language: None,
            quality: Quality::P720,
            width: 1280,
            height: 720,
            bitrate: 3_000_000,
            pixel_format: None,
            profile: Some("High".into()),
            level: Some(31),
        }
    }

    async fn file_stream(dir: &Path, info: MediaInfo) -> Arc<FileStream> {
        let settings = Arc::new(TranscoderSettings {
            stream_dir: dir.to_path_buf(),
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ffprobe_path: "/nonexistent/ffprobe".into(),
            hwaccel: HwAccelSettings::new(HwAccelKind::Disabled, "fast", ""),
        });
        FileStream::new(Path::new("/lib/video.mkv"), Arc::new(info), settings)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_master_lists_lower_qualities() {
        let dir = tempfile::tempdir().unwrap();
        let fs = file_stream(dir.path(), info(Some(video_720p()))).await;
        let master = fs.master();

        assert!(master.starts_with("#EXTM3U\n#EXT-X-VERSION:6\n"));
        assert!(master.contains(
            "#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=2400000,BANDWIDTH=3000000,RESOLUTION=1280x720,\
             CODECS=\"avc1.64001f\",AUDIO=\"audio\",CLOSED-CAPTIONS=NONE\n./original/index.m3u8\n"
        ));
        assert!(master.contains("./240p/index.m3u8"));
        assert!(master.contains("RESOLUTION=853x480"));
        // Same codec family as the source, so 720p is only offered as original
        assert!(!master.contains("./720p/index.m3u8"));
        assert!(!master.contains("./1080p/index.m3u8"));

        assert!(master.contains(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",LANGUAGE=\"eng\",NAME=\"eng\",DEFAULT=YES,\
             CHANNELS=\"2\",URI=\"./audio/1/index.m3u8\""
        ));
        assert_eq!(master.matches("DEFAULT=YES").count(), 1);
    }

    #[tokio::test]
    async fn test_first_track_is_default_when_none_is() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = info(None);
        info.audios[1].is_default = false;
        let fs = file_stream(dir.path(), info).await;

        let master = fs.master();
        assert!(!master.contains("EXT-X-STREAM-INF"));
        assert!(master.contains("NAME=\"jpn\",DEFAULT=YES,"));
    }

    #[tokio::test]
    async fn test_audio_only_file_uses_synthetic_segments() {
        let dir = tempfile::tempdir().unwrap();
        let fs = file_stream(dir.path(), info(None)).await;

        let index = fs.audio_index(0).unwrap();
        assert_eq!(index.matches("#EXTINF:2.000000").count(), 4);
        assert!(index.ends_with("#EXTINF:1.000000\nsegment-4.ts\n#EXT-X-ENDLIST"));

        assert_matches!(fs.audio_index(7), Err(TranscodeError::UnknownAudio(7)));
        assert_matches!(fs.video_index(Quality::P480), Err(TranscodeError::UnknownQuality(_)));
    }

    #[tokio::test]
    async fn test_destroy_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let fs = file_stream(dir.path(), info(None)).await;
        let out_dir = dir.path().join(&fs.info.sha);
        assert!(out_dir.exists());

        fs.destroy().await;
        assert!(!out_dir.exists());
    }
}
