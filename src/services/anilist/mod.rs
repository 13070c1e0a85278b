//! Remote catalogue (AniList) access
//!
//! [`Catalogue`] is the seam the scanner, entry assembler and playback manager
//! depend on; [`AnilistClient`] is the GraphQL implementation.

mod client;
pub mod models;

use anyhow::Result;
use async_trait::async_trait;

pub use client::AnilistClient;
pub use models::*;

/// Typed access to the remote catalogue. Every call is rate limited by the
/// implementation.
#[async_trait]
pub trait Catalogue: Send + Sync + 'static {
    async fn media_by_id(&self, id: i32) -> Result<Media>;

    /// The authenticated user's collection
    async fn user_collection(&self) -> Result<AnimeCollection>;

    /// Candidate media ids for a free-text title
    async fn search_ids(&self, title: &str) -> Result<Vec<i32>>;

    /// Write list progress. When `progress` reaches `total_episodes` the entry
    /// is also marked completed.
    async fn update_entry_progress(
        &self,
        media_id: i32,
        progress: i32,
        total_episodes: Option<i32>,
    ) -> Result<()>;

    /// Add each id to the planning list
    async fn add_to_planning(&self, media_ids: &[i32]) -> Result<()>;
}

/// Status to send along with a progress write
pub fn status_for_progress(progress: i32, total_episodes: Option<i32>) -> Option<ListStatus> {
    match total_episodes {
        Some(total) if total > 0 && progress == total => Some(ListStatus::Completed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_at_total_completes_entry() {
        assert_eq!(status_for_progress(12, Some(12)), Some(ListStatus::Completed));
        assert_eq!(status_for_progress(11, Some(12)), None);
        assert_eq!(status_for_progress(3, None), None);
    }
}
