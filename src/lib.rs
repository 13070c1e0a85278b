//! Local anime library backend: scanning and matching, episode entries,
//! external player tracking and on-the-fly HLS streaming.

pub mod api;
pub mod app;
pub mod config;
pub mod jobs;
pub mod media;
pub mod services;

pub use app::{AppState, build_app};
