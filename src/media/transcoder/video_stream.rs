use std::sync::Arc;

use super::hwaccel::HwAccelSettings;
use super::quality::Quality;
use super::stream::StreamHandle;
use crate::media::media_info::Video;

/// A video rendition, either re-encoded to a fixed quality or passed through
pub struct VideoStream {
    quality: Quality,
    source: Video,
    hwaccel: Arc<HwAccelSettings>,
}

impl VideoStream {
    pub fn new(quality: Quality, source: Video, hwaccel: Arc<HwAccelSettings>) -> Self {
        Self {
            quality,
            source,
            hwaccel,
        }
    }

    /// Output width for the target height, keeping the aspect ratio.
    /// Encoders need even dimensions.
    fn width(&self, height: u32) -> u32 {
        if self.source.height == 0 {
            return height * 16 / 9 / 2 * 2;
        }
        let width = (self.source.width as f64 * height as f64 / self.source.height as f64).round() as u32;
        width / 2 * 2
    }
}

impl StreamHandle for VideoStream {
    fn label(&self) -> String {
        self.quality.as_str().to_string()
    }

    fn is_video(&self) -> bool {
        true
    }

    fn transcode_args(&self, segment_times: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-map".into(), "0:V:0".into()];

        if self.quality == Quality::Original {
            args.extend(["-c:v".into(), "copy".into()]);
            return args;
        }

        let height = self.quality.height();
        args.extend(self.hwaccel.encode_flags.iter().cloned());
        args.extend([
            "-vf".into(),
            self.hwaccel.scale_filter(self.width(height), height),
            "-bufsize".into(),
            (self.quality.max_bitrate() as u64 * 5).to_string(),
            "-b:v".into(),
            self.quality.average_bitrate().to_string(),
            "-maxrate".into(),
            self.quality.max_bitrate().to_string(),
            // Keyframes land exactly on segment boundaries
            "-forced-idr".into(),
            "1".into(),
            "-force_key_frames".into(),
            segment_times.to_string(),
            "-strict".into(),
            "-2".into(),
        ]);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::transcoder::hwaccel::HwAccelKind;

    fn source() -> Video {
        Video {
            codec: "h264".into(),
            mime_codec: Some("avc1.640028".into()),
            language: None,
            quality: Quality::P1080,
            width: 1920,
            height: 1080,
            bitrate: 6_000_000,
            pixel_format: Some("yuv420p10le".into()),
            profile: Some("High 10".into()),
            level: Some(40),
        }
    }

    fn stream(quality: Quality) -> VideoStream {
        VideoStream::new(
            quality,
            source(),
            Arc::new(HwAccelSettings::new(HwAccelKind::Disabled, "fast", "")),
        )
    }

    #[test]
    fn test_original_is_copied() {
        let args = stream(Quality::Original).transcode_args("0.000000");
        assert_eq!(args, vec!["-map", "0:V:0", "-c:v", "copy"]);
    }

    #[test]
    fn test_scaled_quality() {
        let args = stream(Quality::P720).transcode_args("2.000000,4.000000");
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=1280:720"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "2400000"]));
        assert!(args.windows(2).any(|w| w == ["-force_key_frames", "2.000000,4.000000"]));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
    }

    #[test]
    fn test_width_is_even() {
        let mut video = source();
        video.width = 1440;
        video.height = 1080;
        let stream = VideoStream::new(
            Quality::P360,
            video,
            Arc::new(HwAccelSettings::new(HwAccelKind::Disabled, "fast", "")),
        );
        assert_eq!(stream.width(360), 480);
        assert_eq!(stream.label(), "360p");
    }
}
