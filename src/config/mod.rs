//! Application configuration management

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::media::transcoder::HwAccelKind;
use crate::services::playback::players::PlayerKind;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host to bind
    pub host: String,

    /// Server port
    pub port: u16,

    /// Library root that the scanner walks
    pub library_path: PathBuf,

    /// Directory holding the local-file store and scan summaries
    pub data_path: PathBuf,

    /// MediaInfo, subtitle and attachment cache
    pub cache_path: PathBuf,

    /// Root for transcoder output (`{transcode_path}/streams/{hash}`)
    pub transcode_path: PathBuf,

    /// Optional library of pre-transcoded derivatives served in optimized mode
    pub pre_transcode_path: Option<PathBuf>,

    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    /// Hardware acceleration used by the transcoder
    pub hwaccel: HwAccelKind,
    pub hwaccel_preset: String,
    pub hwaccel_device: String,

    /// Watch the library and rescan after changes settle
    pub auto_scan: bool,

    /// Debounce window for the auto-scanner, in seconds
    pub auto_scan_debounce_secs: u64,

    /// Expand the catalogue with search + relation crawling during scans
    pub enhanced_scan: bool,

    /// Push progress to the catalogue when an episode is completed
    pub auto_update_progress: bool,

    pub anilist_token: Option<String>,
    pub anilist_username: Option<String>,
    pub mal_token: Option<String>,

    pub catalogue_url: String,
    pub episode_db_url: String,
    pub mal_api_url: String,

    /// Which external player adapter to track
    pub player: PlayerKind,
    pub mpv_socket: String,
    pub vlc_url: String,
    pub vlc_password: String,
    pub mpc_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let default_transcode = env::temp_dir().join("anilib").join("transcode");

        let default_socket = if cfg!(windows) {
            r"\\.\pipe\mpv_ipc".to_string()
        } else {
            "/tmp/mpv_socket".to_string()
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            port: env::var("PORT")
                .unwrap_or_else(|_| "43211".to_string())
                .parse()
                .context("Invalid PORT")?,

            library_path: env::var("LIBRARY_PATH")
                .unwrap_or_else(|_| "./data/library".to_string())
                .into(),

            data_path: env::var("DATA_PATH")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),

            cache_path: env::var("CACHE_PATH")
                .unwrap_or_else(|_| "./data/cache".to_string())
                .into(),

            transcode_path: env::var("TRANSCODE_PATH")
                .map(PathBuf::from)
                .unwrap_or(default_transcode),

            pre_transcode_path: env::var("PRE_TRANSCODE_PATH").ok().map(PathBuf::from),

            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),

            hwaccel: env::var("HWACCEL")
                .unwrap_or_else(|_| "disabled".to_string())
                .parse()
                .context("Invalid HWACCEL")?,

            hwaccel_preset: env::var("HWACCEL_PRESET").unwrap_or_else(|_| "fast".to_string()),

            hwaccel_device: env::var("HWACCEL_DEVICE")
                .unwrap_or_else(|_| "/dev/dri/renderD128".to_string()),

            auto_scan: env::var("AUTO_SCAN")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            auto_scan_debounce_secs: env::var("AUTO_SCAN_DEBOUNCE_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .context("Invalid AUTO_SCAN_DEBOUNCE_SECS")?,

            enhanced_scan: env::var("ENHANCED_SCAN")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            auto_update_progress: env::var("AUTO_UPDATE_PROGRESS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),

            anilist_token: env::var("ANILIST_TOKEN").ok(),
            anilist_username: env::var("ANILIST_USERNAME").ok(),
            mal_token: env::var("MAL_TOKEN").ok(),

            catalogue_url: env::var("CATALOGUE_URL")
                .unwrap_or_else(|_| "https://graphql.anilist.co".to_string()),

            episode_db_url: env::var("EPISODE_DB_URL")
                .unwrap_or_else(|_| "https://api.ani.zip".to_string()),

            mal_api_url: env::var("MAL_API_URL")
                .unwrap_or_else(|_| "https://api.myanimelist.net/v2".to_string()),

            player: env::var("PLAYER")
                .unwrap_or_else(|_| "mpv".to_string())
                .parse()
                .context("Invalid PLAYER")?,

            mpv_socket: env::var("MPV_SOCKET").unwrap_or(default_socket),
            vlc_url: env::var("VLC_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            vlc_password: env::var("VLC_PASSWORD").unwrap_or_default(),
            mpc_url: env::var("MPC_URL").unwrap_or_else(|_| "http://127.0.0.1:13579".to_string()),
        })
    }
}
