//! MyAnimeList progress sync
//!
//! Only used when a MAL token is linked. Failures here are never fatal to the
//! caller; the playback manager logs them and moves on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::rate_limiter::{RateLimitConfig, RateLimitedClient, RateLimiter};

/// Linked-account progress writer
#[async_trait]
pub trait MalSync: Send + Sync + 'static {
    async fn update_progress(&self, mal_id: i32, progress: i32, total: Option<i32>) -> Result<()>;
}

pub struct MalClient {
    http: RateLimitedClient,
    base_url: String,
    token: String,
}

impl MalClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let limiter = RateLimiter::new("mal", RateLimitConfig::catalogue());
        Ok(Self {
            http: RateLimitedClient::new(limiter)?,
            base_url: base_url.into(),
            token: token.into(),
        })
    }
}

/// Form fields for a list status update
fn status_form(progress: i32, total: Option<i32>) -> Vec<(&'static str, String)> {
    let status = match total {
        Some(total) if total > 0 && progress >= total => "completed",
        _ => "watching",
    };
    vec![
        ("num_watched_episodes", progress.to_string()),
        ("status", status.to_string()),
    ]
}

#[async_trait]
impl MalSync for MalClient {
    async fn update_progress(&self, mal_id: i32, progress: i32, total: Option<i32>) -> Result<()> {
        let url = format!(
            "{}/anime/{}/my_list_status",
            self.base_url.trim_end_matches('/'),
            mal_id
        );
        debug!(mal_id, progress, "Updating MAL progress");

        self.http.limiter().wait().await;
        let response = self
            .http
            .inner()
            .patch(&url)
            .bearer_auth(&self.token)
            .form(&status_form(progress, total))
            .send()
            .await
            .context("MAL request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("MAL request failed with status: {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_form() {
        let form = status_form(12, Some(12));
        assert_eq!(form[0], ("num_watched_episodes", "12".to_string()));
        assert_eq!(form[1].1, "completed");
        assert_eq!(status_form(3, None)[1].1, "watching");
    }
}
