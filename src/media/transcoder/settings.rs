use std::path::PathBuf;

use super::hwaccel::HwAccelSettings;
use crate::config::Config;

#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    /// `{transcode_path}/streams`
    pub stream_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub hwaccel: HwAccelSettings,
}

impl TranscoderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_dir: config.transcode_path.join("streams"),
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            hwaccel: HwAccelSettings::new(
                config.hwaccel,
                &config.hwaccel_preset,
                &config.hwaccel_device,
            ),
        }
    }

    /// Output directory of one file's streams
    pub fn file_dir(&self, hash: &str) -> PathBuf {
        self.stream_dir.join(hash)
    }
}
