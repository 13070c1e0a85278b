//! Output qualities offered in the master playlist

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::TranscodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "4k")]
    P4k,
    #[serde(rename = "8k")]
    P8k,
    /// Passthrough of the source video
    #[serde(rename = "original")]
    Original,
}

/// Every transcoded quality, lowest first
pub const QUALITIES: [Quality; 8] = [
    Quality::P240,
    Quality::P360,
    Quality::P480,
    Quality::P720,
    Quality::P1080,
    Quality::P1440,
    Quality::P4k,
    Quality::P8k,
];

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::P240 => "240p",
            Quality::P360 => "360p",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::P1440 => "1440p",
            Quality::P4k => "4k",
            Quality::P8k => "8k",
            Quality::Original => "original",
        }
    }

    /// Bits per second. `Original` has no fixed rate and reports 0.
    pub fn average_bitrate(&self) -> u32 {
        match self {
            Quality::P240 => 400_000,
            Quality::P360 => 800_000,
            Quality::P480 => 1_200_000,
            Quality::P720 => 2_400_000,
            Quality::P1080 => 4_800_000,
            Quality::P1440 => 9_600_000,
            Quality::P4k => 16_000_000,
            Quality::P8k => 28_000_000,
            Quality::Original => 0,
        }
    }

    pub fn max_bitrate(&self) -> u32 {
        match self {
            Quality::P240 => 700_000,
            Quality::P360 => 1_400_000,
            Quality::P480 => 2_100_000,
            Quality::P720 => 4_000_000,
            Quality::P1080 => 8_000_000,
            Quality::P1440 => 12_000_000,
            Quality::P4k => 28_000_000,
            Quality::P8k => 40_000_000,
            Quality::Original => 0,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Quality::P240 => 240,
            Quality::P360 => 360,
            Quality::P480 => 480,
            Quality::P720 => 720,
            Quality::P1080 => 1080,
            Quality::P1440 => 1440,
            Quality::P4k => 2160,
            Quality::P8k => 4320,
            Quality::Original => 0,
        }
    }

    /// Smallest quality at least as tall as `height`
    pub fn from_height(height: u32) -> Quality {
        QUALITIES
            .into_iter()
            .find(|q| q.height() >= height)
            .unwrap_or(Quality::P8k)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QUALITIES
            .into_iter()
            .chain([Quality::Original])
            .find(|q| q.as_str() == s)
            .ok_or_else(|| TranscodeError::UnknownQuality(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_quality() {
        assert_eq!("720p".parse::<Quality>().unwrap(), Quality::P720);
        assert_eq!("4k".parse::<Quality>().unwrap(), Quality::P4k);
        assert_eq!("original".parse::<Quality>().unwrap(), Quality::Original);
        assert_matches!("721p".parse::<Quality>(), Err(TranscodeError::UnknownQuality(_)));
    }

    #[test]
    fn test_from_height() {
        assert_eq!(Quality::from_height(1080), Quality::P1080);
        assert_eq!(Quality::from_height(1076), Quality::P1080);
        assert_eq!(Quality::from_height(100), Quality::P240);
        assert_eq!(Quality::from_height(9000), Quality::P8k);
    }
}
