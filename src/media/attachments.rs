//! Subtitle and font extraction
//!
//! Text subtitles are copied out of the container into
//! `{cache}/{hash}/sub/{index}.{ext}` and attachments (fonts) dumped into
//! `{cache}/{hash}/att/`, so the player can load them next to the stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::media_info::MediaInfo;

pub const SUBTITLES_DIR: &str = "sub";
pub const ATTACHMENTS_DIR: &str = "att";

pub fn subtitles_dir(cache_dir: &Path, hash: &str) -> PathBuf {
    cache_dir.join(hash).join(SUBTITLES_DIR)
}

pub fn attachments_dir(cache_dir: &Path, hash: &str) -> PathBuf {
    cache_dir.join(hash).join(ATTACHMENTS_DIR)
}

/// Extract subtitles and fonts once per file
pub async fn extract(ffmpeg_path: &str, cache_dir: &Path, info: &MediaInfo) -> Result<()> {
    let sub_dir = subtitles_dir(cache_dir, &info.sha);
    let att_dir = attachments_dir(cache_dir, &info.sha);

    if sub_dir.exists() && att_dir.exists() {
        debug!(hash = %info.sha, "Attachments already extracted");
        return Ok(());
    }

    let outputs = subtitle_outputs(&sub_dir, info);
    if outputs.is_empty() && info.fonts.is_empty() {
        tokio::fs::create_dir_all(&sub_dir).await?;
        tokio::fs::create_dir_all(&att_dir).await?;
        return Ok(());
    }

    tokio::fs::create_dir_all(&sub_dir)
        .await
        .with_context(|| format!("Failed to create {}", sub_dir.display()))?;
    tokio::fs::create_dir_all(&att_dir)
        .await
        .with_context(|| format!("Failed to create {}", att_dir.display()))?;

    info!(
        path = %info.path,
        subtitles = outputs.len(),
        fonts = info.fonts.len(),
        "Extracting subtitles and attachments"
    );

    let mut command = Command::new(ffmpeg_path);
    // Attachments are written to the working directory under their own name
    command
        .current_dir(&att_dir)
        .args(["-dump_attachment:t", ""])
        .arg("-y")
        .arg("-i")
        .arg(&info.path);
    for (index, out) in &outputs {
        command
            .arg("-map")
            .arg(format!("0:s:{index}"))
            .args(["-c:s", "copy"])
            .arg(out);
    }

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to run ffmpeg for attachment extraction")?;

    // ffmpeg exits non-zero when only attachments are dumped, even though
    // the fonts were written
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let missing: Vec<_> = outputs.iter().filter(|(_, out)| !out.exists()).collect();
        if !missing.is_empty() {
            warn!(
                path = %info.path,
                missing = missing.len(),
                stderr = %stderr.trim(),
                "Subtitle extraction incomplete"
            );
        }
    }

    debug!(path = %info.path, "Attachment extraction finished");
    Ok(())
}

/// `(subtitle index, output file)` for every text subtitle
fn subtitle_outputs(sub_dir: &Path, info: &MediaInfo) -> Vec<(usize, PathBuf)> {
    info.subtitles
        .iter()
        .filter_map(|s| {
            let ext = s.extension.as_ref()?;
            Some((s.index, sub_dir.join(format!("{}.{ext}", s.index))))
        })
        .collect()
}

/// Resolve `name` inside `dir`, refusing anything that could escape it
pub fn resolve_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(name).ok()?;
    let candidate = Path::new(decoded.as_ref());
    let mut components = candidate.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(file)), None) => Some(dir.join(file)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::media_info::Subtitle;

    fn subtitle(index: usize, extension: Option<&str>) -> Subtitle {
        Subtitle {
            index,
            title: None,
            language: None,
            codec: "ass".into(),
            extension: extension.map(str::to_string),
            is_default: false,
            is_forced: false,
            link: None,
        }
    }

    fn info(subtitles: Vec<Subtitle>) -> MediaInfo {
        MediaInfo {
            sha: "hash".into(),
            path: "/lib/video.mkv".into(),
            extension: "mkv".into(),
            mime_codec: None,
            size: 0,
            duration: 0.0,
            container: None,
            video: None,
            videos: Vec::new(),
            audios: Vec::new(),
            subtitles,
            fonts: Vec::new(),
            chapters: Vec::new(),
        }
    }

    #[test]
    fn test_only_text_subtitles_are_extracted() {
        let info = info(vec![subtitle(0, Some("ass")), subtitle(1, None), subtitle(2, Some("srt"))]);
        let outputs = subtitle_outputs(Path::new("/cache/hash/sub"), &info);
        assert_eq!(
            outputs,
            vec![
                (0, PathBuf::from("/cache/hash/sub/0.ass")),
                (2, PathBuf::from("/cache/hash/sub/2.srt")),
            ]
        );
    }

    #[tokio::test]
    async fn test_populated_cache_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(subtitles_dir(dir.path(), "hash")).unwrap();
        std::fs::create_dir_all(attachments_dir(dir.path(), "hash")).unwrap();

        // Would fail if ffmpeg were started
        extract("/nonexistent/ffmpeg", dir.path(), &info(vec![subtitle(0, Some("ass"))]))
            .await
            .unwrap();
    }

    #[test]
    fn test_resolve_in_rejects_traversal() {
        let dir = Path::new("/cache/hash/sub");
        assert_eq!(resolve_in(dir, "0.ass"), Some(PathBuf::from("/cache/hash/sub/0.ass")));
        assert_eq!(resolve_in(dir, "../info.json"), None);
        assert_eq!(resolve_in(dir, "..%2Finfo.json"), None);
        assert_eq!(resolve_in(dir, "/etc/passwd"), None);
    }
}
