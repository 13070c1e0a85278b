//! Torrent daemon abstraction
//!
//! The daemon itself (qBittorrent, Transmission...) runs out of process.
//! [`TorrentClient`] is the surface the rest of the crate needs from it, and
//! [`smart_select`] layers per-episode file selection on top.

pub mod smart_select;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use smart_select::{SmartSelect, SmartSelection, info_hash_from_magnet, smart_select};

#[derive(Debug, thiserror::Error)]
pub enum TorrentClientError {
    #[error("the torrent client does not support this operation")]
    NotSupported,

    #[error("no file in the torrent matches a missing episode")]
    NoMatchingFiles,

    #[error("torrent client error: {0}")]
    Backend(String),
}

/// One file inside a torrent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFile {
    pub index: usize,
    /// Path relative to the torrent root
    pub path: String,
    pub size: u64,
}

impl TorrentFile {
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.path)
    }
}

#[async_trait]
pub trait TorrentClient: Send + Sync + 'static {
    async fn add_magnets(&self, magnets: &[String], destination: &Path) -> Result<(), TorrentClientError>;

    async fn remove_torrents(&self, hashes: &[String]) -> Result<(), TorrentClientError>;

    async fn pause_torrents(&self, hashes: &[String]) -> Result<(), TorrentClientError>;

    async fn resume_torrents(&self, hashes: &[String]) -> Result<(), TorrentClientError>;

    /// Files of a torrent. Empty while the daemon is still fetching metadata.
    async fn get_files(&self, hash: &str) -> Result<Vec<TorrentFile>, TorrentClientError>;

    /// Set the download priority of the given files; 0 skips them
    async fn set_file_priority(
        &self,
        _hash: &str,
        _indices: &[usize],
        _priority: u8,
    ) -> Result<(), TorrentClientError> {
        Err(TorrentClientError::NotSupported)
    }
}
