//! Media information extraction with ffprobe
//!
//! ffprobe's JSON output is stable, so it is parsed directly rather than
//! going through bindings. Results are cached on disk under the file hash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::transcoder::Quality;

const PROBE_TIMEOUT: Duration = Duration::from_secs(40);
const INFO_FILE: &str = "info.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    /// Cache key, see [`file_hash`]
    pub sha: String,
    pub path: String,
    pub extension: String,
    /// e.g. `video/x-matroska; codecs="avc1.640028, mp4a.40.2"`
    pub mime_codec: Option<String>,
    pub size: u64,
    /// Seconds
    pub duration: f64,
    pub container: Option<String>,
    pub video: Option<Video>,
    pub videos: Vec<Video>,
    pub audios: Vec<Audio>,
    pub subtitles: Vec<Subtitle>,
    /// Attachment filenames
    pub fonts: Vec<String>,
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub codec: String,
    /// RFC 6381 codec string
    pub mime_codec: Option<String>,
    pub language: Option<String>,
    pub quality: Quality,
    pub width: u32,
    pub height: u32,
    /// Bits per second, the container's when the stream has none
    pub bitrate: u32,
    pub pixel_format: Option<String>,
    pub profile: Option<String>,
    pub level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audio {
    /// Position among the audio streams
    pub index: usize,
    pub title: Option<String>,
    pub language: Option<String>,
    pub codec: String,
    pub mime_codec: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    pub channels: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtitle {
    /// Position among the subtitle streams
    pub index: usize,
    pub title: Option<String>,
    pub language: Option<String>,
    pub codec: String,
    /// Extension of the extracted file, when the codec is text based
    pub extension: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    /// Relative link served by the subtitles endpoint
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub start_time: f64,
    pub end_time: f64,
    pub name: String,
}

/// FFprobe JSON output structures
mod ffprobe {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
        #[serde(default)]
        pub streams: Vec<Stream>,
        #[serde(default)]
        pub chapters: Vec<FfprobeChapter>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_name: Option<String>,
        pub codec_type: Option<String>,
        pub profile: Option<String>,
        pub level: Option<i32>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub channels: Option<u32>,
        pub bit_rate: Option<String>,
        pub bits_per_raw_sample: Option<String>,
        pub disposition: Option<Disposition>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        pub default: Option<i32>,
        pub forced: Option<i32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FfprobeChapter {
        pub start_time: Option<String>,
        pub end_time: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    impl Stream {
        pub fn kind(&self) -> &str {
            self.codec_type.as_deref().unwrap_or_default()
        }

        pub fn codec(&self) -> String {
            self.codec_name.clone().unwrap_or_default()
        }

        pub fn tag(&self, key: &str) -> Option<String> {
            self.tags
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
        }

        pub fn is_default(&self) -> bool {
            self.disposition.as_ref().and_then(|d| d.default) == Some(1)
        }

        pub fn is_forced(&self) -> bool {
            self.disposition.as_ref().and_then(|d| d.forced) == Some(1)
        }
    }
}

/// Stable cache key for a file: its path and modification time
pub fn file_hash(path: &Path) -> Result<String> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(mtime.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..40].to_string())
}

/// Probe results, cached under `{cache_dir}/{hash}/info.json`
pub struct MediaInfoExtractor {
    ffprobe_path: String,
    cache_dir: PathBuf,
}

impl MediaInfoExtractor {
    pub fn new(ffprobe_path: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn file_cache_dir(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(hash)
    }

    pub async fn get_info(&self, path: &Path) -> Result<MediaInfo> {
        let hash = file_hash(path)?;
        let cached = self.file_cache_dir(&hash).join(INFO_FILE);

        if let Ok(bytes) = tokio::fs::read(&cached).await {
            match serde_json::from_slice::<MediaInfo>(&bytes) {
                Ok(info) => {
                    debug!(path = %path.display(), hash = %hash, "Media info loaded from cache");
                    return Ok(info);
                }
                Err(e) => warn!(path = %cached.display(), error = %e, "Ignoring unreadable media info cache"),
            }
        }

        let info = self.probe(path, &hash).await?;

        tokio::fs::create_dir_all(self.file_cache_dir(&hash))
            .await
            .context("Failed to create media info cache directory")?;
        tokio::fs::write(&cached, serde_json::to_vec(&info)?)
            .await
            .with_context(|| format!("Failed to write {}", cached.display()))?;
        Ok(info)
    }

    async fn probe(&self, path: &Path, hash: &str) -> Result<MediaInfo> {
        debug!(path = %path.display(), "Analyzing media file with ffprobe");

        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&self.ffprobe_path)
                .args(["-v", "error"])
                .args(["-print_format", "json"])
                .args(["-show_format", "-show_streams", "-show_chapters"])
                .arg(path)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("ffprobe timed out")?
        .with_context(|| format!("Failed to execute ffprobe for '{}'", path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffprobe failed for '{}' ({}): {}",
                path.display(),
                output.status,
                stderr.trim()
            );
        }

        let probe: ffprobe::FfprobeOutput = serde_json::from_slice(&output.stdout)
            .context("Failed to parse ffprobe JSON output")?;
        let info = convert_probe_output(path, hash, probe);

        info!(
            path = %path.display(),
            videos = info.videos.len(),
            audios = info.audios.len(),
            subtitles = info.subtitles.len(),
            duration = info.duration,
            "Media analysis complete"
        );
        Ok(info)
    }
}

fn convert_probe_output(path: &Path, hash: &str, probe: ffprobe::FfprobeOutput) -> MediaInfo {
    let format = probe.format;
    let container_bitrate = format
        .as_ref()
        .and_then(|f| f.bit_rate.as_deref())
        .and_then(|b| b.parse::<u32>().ok())
        .unwrap_or_default();

    let videos: Vec<Video> = probe
        .streams
        .iter()
        .filter(|s| s.kind() == "video" && s.width.unwrap_or(0) > 0)
        .map(|s| {
            let height = s.height.unwrap_or_default();
            Video {
                codec: s.codec(),
                mime_codec: mime_codec(s),
                language: s.tag("language"),
                quality: Quality::from_height(height),
                width: s.width.unwrap_or_default(),
                height,
                // mkv rarely reports per-stream bitrate
                bitrate: s
                    .bit_rate
                    .as_deref()
                    .and_then(|b| b.parse().ok())
                    .unwrap_or(container_bitrate),
                pixel_format: s.pix_fmt.clone(),
                profile: s.profile.clone(),
                level: s.level,
            }
        })
        .collect();

    let audios: Vec<Audio> = probe
        .streams
        .iter()
        .filter(|s| s.kind() == "audio")
        .enumerate()
        .map(|(index, s)| Audio {
            index,
            title: s.tag("title"),
            language: s.tag("language"),
            codec: s.codec(),
            mime_codec: mime_codec(s),
            is_default: s.is_default(),
            is_forced: s.is_forced(),
            channels: s.channels.unwrap_or(2),
        })
        .collect();

    let subtitles: Vec<Subtitle> = probe
        .streams
        .iter()
        .filter(|s| s.kind() == "subtitle")
        .enumerate()
        .map(|(index, s)| {
            let extension = subtitle_extension(&s.codec()).map(str::to_string);
            Subtitle {
                index,
                title: s.tag("title"),
                language: s.tag("language"),
                codec: s.codec(),
                link: extension.as_ref().map(|ext| format!("/{index}.{ext}")),
                extension,
                is_default: s.is_default(),
                is_forced: s.is_forced(),
            }
        })
        .collect();

    let fonts = probe
        .streams
        .iter()
        .filter(|s| s.kind() == "attachment")
        .filter_map(|s| s.tag("filename"))
        .collect();

    let chapters = probe
        .chapters
        .iter()
        .filter_map(|ch| {
            Some(Chapter {
                start_time: ch.start_time.as_ref()?.parse().ok()?,
                end_time: ch.end_time.as_ref()?.parse().ok()?,
                name: ch.tags.get("title").cloned().unwrap_or_default(),
            })
        })
        .collect();

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let codecs: Vec<&str> = [
        videos.first().and_then(|v| v.mime_codec.as_deref()),
        audios.first().and_then(|a| a.mime_codec.as_deref()),
    ]
    .into_iter()
    .flatten()
    .collect();
    let mime_codec = mime_guess::from_ext(&extension).first().map(|mime| {
        if codecs.is_empty() {
            mime.to_string()
        } else {
            format!("{mime}; codecs=\"{}\"", codecs.join(", "))
        }
    });

    MediaInfo {
        sha: hash.to_string(),
        path: path.to_string_lossy().into_owned(),
        extension,
        mime_codec,
        size: format
            .as_ref()
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        duration: format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok())
            .unwrap_or_default(),
        container: format.and_then(|f| f.format_name),
        video: videos.first().cloned(),
        videos,
        audios,
        subtitles,
        fonts,
        chapters,
    }
}

fn subtitle_extension(codec: &str) -> Option<&'static str> {
    match codec {
        "subrip" => Some("srt"),
        "ass" | "ssa" => Some("ass"),
        "webvtt" | "vtt" => Some("vtt"),
        _ => None,
    }
}

/// RFC 6381 codec string for HLS `CODECS`
fn mime_codec(stream: &ffprobe::Stream) -> Option<String> {
    let profile = stream.profile.as_deref().unwrap_or_default().to_lowercase();
    let level = stream.level.unwrap_or_default();
    match stream.codec_name.as_deref()? {
        "h264" => {
            let prefix = match profile.as_str() {
                "high" => "avc1.6400",
                "main" => "avc1.4D40",
                "baseline" => "avc1.42E0",
                _ => "avc1.4240",
            };
            Some(format!("{prefix}{level:02x}"))
        }
        "h265" | "hevc" => {
            let tier = if profile == "main 10" { "hvc1.2.4" } else { "hvc1.1.4" };
            Some(format!("{tier}.L{level:02X}.BO"))
        }
        "av1" => {
            let profile = match profile.as_str() {
                "main" => ".0",
                "high" => ".1",
                "professional" => ".2",
                _ => "",
            };
            let depth = stream
                .bits_per_raw_sample
                .as_deref()
                .and_then(|b| b.parse::<u32>().ok())
                .filter(|b| matches!(b, 8 | 10 | 12))
                .unwrap_or(8);
            Some(format!("av01{profile}.{level:02X}M.{depth:02}"))
        }
        "aac" => Some(if profile == "he" { "mp4a.40.5" } else { "mp4a.40.2" }.to_string()),
        "opus" => Some("Opus".to_string()),
        "ac3" => Some("mp4a.a5".to_string()),
        "eac3" => Some("mp4a.a6".to_string()),
        "flac" => Some("fLaC".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROBE: &str = r#"{
        "streams": [
            { "index": 0, "codec_name": "h264", "codec_type": "video", "profile": "High",
              "level": 40, "width": 1920, "height": 1080, "pix_fmt": "yuv420p",
              "disposition": { "default": 1, "forced": 0 } },
            { "index": 1, "codec_name": "aac", "codec_type": "audio", "profile": "LC",
              "channels": 2, "disposition": { "default": 1, "forced": 0 },
              "tags": { "language": "jpn", "title": "Japanese" } },
            { "index": 2, "codec_name": "ass", "codec_type": "subtitle",
              "disposition": { "default": 1, "forced": 0 }, "tags": { "language": "eng" } },
            { "index": 3, "codec_name": "hdmv_pgs_subtitle", "codec_type": "subtitle" },
            { "index": 4, "codec_name": "ttf", "codec_type": "attachment",
              "tags": { "filename": "Roboto.ttf", "mimetype": "font/ttf" } }
        ],
        "chapters": [
            { "start_time": "0.000000", "end_time": "90.000000", "tags": { "title": "Opening" } }
        ],
        "format": { "format_name": "matroska,webm", "duration": "1420.500000",
                    "size": "734003200", "bit_rate": "4133000" }
    }"#;

    fn info() -> MediaInfo {
        let probe: ffprobe::FfprobeOutput = serde_json::from_str(PROBE).unwrap();
        convert_probe_output(Path::new("/lib/Frieren - 05.mkv"), "abc", probe)
    }

    #[test]
    fn test_convert_probe_output() {
        let info = info();
        assert_eq!(info.extension, "mkv");
        assert_eq!(info.duration, 1420.5);
        assert_eq!(info.size, 734_003_200);

        let video = info.video.unwrap();
        assert_eq!(video.mime_codec.as_deref(), Some("avc1.640028"));
        assert_eq!(video.quality, Quality::P1080);
        // Falls back to the container bitrate
        assert_eq!(video.bitrate, 4_133_000);

        assert_eq!(info.audios[0].mime_codec.as_deref(), Some("mp4a.40.2"));
        assert_eq!(info.audios[0].language.as_deref(), Some("jpn"));
        assert!(info.audios[0].is_default);

        assert_eq!(info.subtitles.len(), 2);
        assert_eq!(info.subtitles[0].link.as_deref(), Some("/0.ass"));
        assert_eq!(info.subtitles[1].extension, None);

        assert_eq!(info.fonts, vec!["Roboto.ttf".to_string()]);
        assert_eq!(info.chapters[0].name, "Opening");
        assert_eq!(info.container.as_deref(), Some("matroska,webm"));
    }

    #[test]
    fn test_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("video.mkv");
        std::fs::write(&file, b"data").unwrap();

        let first = file_hash(&file).unwrap();
        assert_eq!(first, file_hash(&file).unwrap());
        assert_eq!(first.len(), 40);

        let other = dir.path().join("other.mkv");
        std::fs::write(&other, b"data").unwrap();
        assert_ne!(first, file_hash(&other).unwrap());
    }

    #[tokio::test]
    async fn test_cached_info_skips_probe() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("video.mkv");
        std::fs::write(&file, b"data").unwrap();
        let hash = file_hash(&file).unwrap();

        let mut cached = info();
        cached.sha = hash.clone();
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(cache_dir.join(&hash)).unwrap();
        std::fs::write(
            cache_dir.join(&hash).join(INFO_FILE),
            serde_json::to_vec(&cached).unwrap(),
        )
        .unwrap();

        let extractor = MediaInfoExtractor::new("/nonexistent/ffprobe", &cache_dir);
        assert_eq!(extractor.get_info(&file).await.unwrap(), cached);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = MediaInfoExtractor::new("ffprobe", dir.path());
        assert!(extractor.get_info(Path::new("/nonexistent/video.mkv")).await.is_err());
    }
}
