//! Hardware acceleration flags for the encoder

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelKind {
    #[default]
    Disabled,
    Vaapi,
    Qsv,
    Nvidia,
}

impl HwAccelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HwAccelKind::Disabled => "disabled",
            HwAccelKind::Vaapi => "vaapi",
            HwAccelKind::Qsv => "qsv",
            HwAccelKind::Nvidia => "nvidia",
        }
    }
}

impl fmt::Display for HwAccelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HwAccelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "disabled" | "cpu" | "none" => Ok(HwAccelKind::Disabled),
            "vaapi" => Ok(HwAccelKind::Vaapi),
            "qsv" | "intel" => Ok(HwAccelKind::Qsv),
            "nvidia" | "cuda" | "nvenc" => Ok(HwAccelKind::Nvidia),
            other => anyhow::bail!("unknown hardware acceleration '{other}'"),
        }
    }
}

/// Resolved ffmpeg flags for one acceleration kind
#[derive(Debug, Clone, PartialEq)]
pub struct HwAccelSettings {
    pub kind: HwAccelKind,
    pub decode_flags: Vec<String>,
    pub encode_flags: Vec<String>,
    /// Scale filter with `{w}` and `{h}` placeholders
    scale_filter: String,
}

fn flags(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl HwAccelSettings {
    pub fn new(kind: HwAccelKind, preset: &str, device: &str) -> Self {
        match kind {
            HwAccelKind::Disabled => Self {
                kind,
                decode_flags: Vec::new(),
                encode_flags: flags(&[
                    "-c:v", "libx264", "-preset", preset,
                    // Forced keyframes must not be moved by scene detection
                    "-sc_threshold", "0",
                    "-pix_fmt", "yuv420p",
                ]),
                scale_filter: "scale={w}:{h}".to_string(),
            },
            HwAccelKind::Vaapi => Self {
                kind,
                decode_flags: flags(&[
                    "-hwaccel", "vaapi",
                    "-hwaccel_device", device,
                    "-hwaccel_output_format", "vaapi",
                ]),
                encode_flags: flags(&["-c:v", "h264_vaapi"]),
                // CPU-decoded frames are uploaded before scaling
                scale_filter: "format=nv12|vaapi,hwupload,scale_vaapi={w}:{h}:format=nv12".to_string(),
            },
            HwAccelKind::Qsv => Self {
                kind,
                decode_flags: flags(&[
                    "-hwaccel", "qsv",
                    "-qsv_device", device,
                    "-hwaccel_output_format", "qsv",
                ]),
                encode_flags: flags(&["-c:v", "h264_qsv", "-preset", preset]),
                scale_filter: "format=nv12|qsv,hwupload,scale_qsv={w}:{h}:format=nv12".to_string(),
            },
            HwAccelKind::Nvidia => Self {
                kind,
                decode_flags: flags(&[
                    "-hwaccel", "cuda",
                    "-hwaccel_output_format", "cuda",
                ]),
                encode_flags: flags(&[
                    "-c:v", "h264_nvenc", "-preset", preset,
                    "-no-scenecut", "1",
                ]),
                scale_filter: "format=nv12|cuda,hwupload,scale_cuda={w}:{h}:format=nv12".to_string(),
            },
        }
    }

    pub fn scale_filter(&self, width: u32, height: u32) -> String {
        self.scale_filter
            .replace("{w}", &width.to_string())
            .replace("{h}", &height.to_string())
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != HwAccelKind::Disabled
    }

    /// Whether encoder stderr shows the accelerated path failing
    pub fn is_failure_output(&self, stderr: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let lower = stderr.to_lowercase();
        lower.contains("failed")
            && ["hwaccel", "vaapi", "qsv", "cuvid", "cuda", "vdpau"]
                .iter()
                .any(|k| lower.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_encoding_forces_8bit() {
        let hw = HwAccelSettings::new(HwAccelKind::Disabled, "fast", "");
        assert!(hw.decode_flags.is_empty());
        assert!(hw.encode_flags.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
        assert!(hw.encode_flags.windows(2).any(|w| w == ["-sc_threshold", "0"]));
        assert_eq!(hw.scale_filter(1280, 720), "scale=1280:720");
    }

    #[test]
    fn test_vaapi_uses_device() {
        let hw = HwAccelSettings::new(HwAccelKind::Vaapi, "fast", "/dev/dri/renderD129");
        assert!(hw.decode_flags.contains(&"/dev/dri/renderD129".to_string()));
        assert_eq!(
            hw.scale_filter(1920, 1080),
            "format=nv12|vaapi,hwupload,scale_vaapi=1920:1080:format=nv12"
        );
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("NVIDIA".parse::<HwAccelKind>().unwrap(), HwAccelKind::Nvidia);
        assert_eq!("disabled".parse::<HwAccelKind>().unwrap(), HwAccelKind::Disabled);
        assert!("metal".parse::<HwAccelKind>().is_err());
    }

    #[test]
    fn test_failure_detection() {
        let hw = HwAccelSettings::new(HwAccelKind::Vaapi, "fast", "/dev/dri/renderD128");
        assert!(hw.is_failure_output("Failed to initialise VAAPI connection"));
        assert!(!hw.is_failure_output("Past duration 0.999 too large"));

        let cpu = HwAccelSettings::new(HwAccelKind::Disabled, "fast", "");
        assert!(!cpu.is_failure_output("Failed to initialise VAAPI connection"));
    }
}
