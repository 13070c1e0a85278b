//! VLC through its HTTP interface (`/requests/status.json`)

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{MediaPlayer, PlayerKind, PlayerStatus};

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    state: String,
    /// Seconds
    #[serde(default)]
    length: f64,
    /// Fraction of the video played
    #[serde(default)]
    position: f64,
    information: Option<Information>,
}

#[derive(Debug, Deserialize)]
struct Information {
    #[serde(default)]
    category: HashMap<String, Category>,
}

#[derive(Debug, Deserialize)]
struct Category {
    #[serde(default)]
    filename: Option<String>,
}

fn parse_status(body: &str) -> Result<Option<PlayerStatus>> {
    let status: Status = serde_json::from_str(body).context("Invalid VLC status")?;
    let filename = status
        .information
        .as_ref()
        .and_then(|info| info.category.get("meta"))
        .and_then(|meta| meta.filename.clone());

    let Some(filename) = filename else {
        return Ok(None);
    };
    Ok(Some(PlayerStatus {
        filename,
        filepath: String::new(),
        completion_percentage: status.position,
        playing: status.state == "playing",
        duration_ms: (status.length * 1000.0) as i64,
    }))
}

pub struct Vlc {
    http: reqwest::Client,
    base_url: String,
    password: String,
}

impl Vlc {
    pub fn new(base_url: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build VLC HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            password: password.to_string(),
        })
    }

    async fn request(&self, query: &[(&str, &str)]) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/requests/status.json", self.base_url))
            .basic_auth("", Some(&self.password))
            .query(query)
            .send()
            .await
            .context("VLC is not reachable")?;

        if !response.status().is_success() {
            anyhow::bail!("VLC returned {}", response.status());
        }
        response.text().await.context("Failed to read VLC response")
    }
}

#[async_trait]
impl MediaPlayer for Vlc {
    fn kind(&self) -> PlayerKind {
        PlayerKind::Vlc
    }

    async fn open(&self, path: &str) -> Result<()> {
        let input = Url::from_file_path(path)
            .map(String::from)
            .unwrap_or_else(|_| path.to_string());
        debug!(input = %input, "Opening in VLC");
        self.request(&[("command", "in_play"), ("input", input.as_str())]).await?;
        Ok(())
    }

    async fn status(&self) -> Result<Option<PlayerStatus>> {
        let body = self.request(&[]).await?;
        parse_status(&body)
    }

    async fn stop(&self) -> Result<()> {
        self.request(&[("command", "pl_stop")]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_playing_status() {
        let body = r#"{
            "state": "playing",
            "length": 1440,
            "position": 0.5,
            "time": 720,
            "information": {
                "category": {
                    "meta": { "filename": "[Group] Frieren - 05 (1080p).mkv" },
                    "Stream 0": { "Codec": "H264" }
                }
            }
        }"#;
        let status = parse_status(body).unwrap().unwrap();
        assert_eq!(status.filename, "[Group] Frieren - 05 (1080p).mkv");
        assert_eq!(status.duration_ms, 1_440_000);
        assert!(status.playing);
        assert_eq!(status.location(), "[Group] Frieren - 05 (1080p).mkv");
    }

    #[test]
    fn test_idle_vlc_has_no_status() {
        let body = r#"{ "state": "stopped", "length": 0, "position": 0 }"#;
        assert!(parse_status(body).unwrap().is_none());
    }
}
