//! MPC-HC through its web interface (`variables.html`)

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{MediaPlayer, PlayerKind, PlayerStatus};

static VARIABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<p id="([^"]+)">([^<]*)</p>"#).unwrap());

/// `state` value while playing
const STATE_PLAYING: &str = "2";

/// `wm_command` id for Stop
const CMD_STOP: &str = "890";

fn parse_variables(html: &str) -> HashMap<String, String> {
    VARIABLE_RE
        .captures_iter(html)
        .map(|c| (c[1].to_string(), decode_entities(&c[2])))
        .collect()
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn parse_status(html: &str) -> Option<PlayerStatus> {
    let vars = parse_variables(html);
    let number = |key: &str| vars.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);

    let duration = number("duration");
    let filename = vars.get("file").cloned().unwrap_or_default();
    if filename.is_empty() || duration <= 0.0 {
        return None;
    }

    Some(PlayerStatus {
        filename,
        filepath: vars.get("filepath").cloned().unwrap_or_default(),
        completion_percentage: number("position") / duration,
        playing: vars.get("state").map(String::as_str) == Some(STATE_PLAYING),
        duration_ms: duration as i64,
    })
}

pub struct MpcHc {
    http: reqwest::Client,
    base_url: String,
}

impl MpcHc {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build MPC-HC HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, page: &str, query: &[(&str, &str)]) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/{page}", self.base_url))
            .query(query)
            .send()
            .await
            .context("MPC-HC is not reachable")?;
        if !response.status().is_success() {
            anyhow::bail!("MPC-HC returned {}", response.status());
        }
        response.text().await.context("Failed to read MPC-HC response")
    }
}

#[async_trait]
impl MediaPlayer for MpcHc {
    fn kind(&self) -> PlayerKind {
        PlayerKind::MpcHc
    }

    async fn open(&self, path: &str) -> Result<()> {
        debug!(path, "Opening in MPC-HC");
        self.get("browser.html", &[("path", path)]).await?;
        Ok(())
    }

    async fn status(&self) -> Result<Option<PlayerStatus>> {
        let html = self.get("variables.html", &[]).await?;
        Ok(parse_status(&html))
    }

    async fn stop(&self) -> Result<()> {
        self.get("command.html", &[("wm_command", CMD_STOP)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
<p id="file">Frieren - 05 &amp; more.mkv</p>
<p id="filepath">C:\Anime\Frieren - 05 &amp; more.mkv</p>
<p id="state">2</p>
<p id="position">720000</p>
<p id="duration">1440000</p>
</body></html>"#;

    #[test]
    fn test_parse_variables_page() {
        let status = parse_status(PAGE).unwrap();
        assert_eq!(status.filename, "Frieren - 05 & more.mkv");
        assert_eq!(status.filepath, r"C:\Anime\Frieren - 05 & more.mkv");
        assert!((status.completion_percentage - 0.5).abs() < 1e-9);
        assert!(status.playing);
        assert_eq!(status.duration_ms, 1_440_000);
    }

    #[test]
    fn test_nothing_loaded() {
        let page = r#"<p id="file"></p><p id="duration">0</p>"#;
        assert!(parse_status(page).is_none());
    }
}
