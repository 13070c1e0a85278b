//! Library services and remote integrations

pub mod anilist;
pub mod anizip;
pub mod cache;
pub mod events;
pub mod filename_parser;
pub mod library_store;
pub mod local_file;
pub mod mal;
pub mod media_entry;
pub mod playback;
pub mod rate_limiter;
pub mod relation_tree;
pub mod scanner;
pub mod torrent_client;

pub use events::{ClientEvent, EventBus};
pub use library_store::LibraryStore;
pub use local_file::LocalFile;
