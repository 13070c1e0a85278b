//! Episode database client (ani.zip mappings)
//!
//! Base URL: https://api.ani.zip
//! Returns per-episode AniDB records keyed by AniDB key ("1", "S1", "OP1"...).

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rate_limiter::{RateLimitedClient, RateLimiter};

/// Which id space a lookup uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Anilist,
    Mal,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anilist => "anilist",
            Platform::Mal => "mal",
        }
    }

    fn query_key(&self) -> &'static str {
        match self {
            Platform::Anilist => "anilist_id",
            Platform::Mal => "mal_id",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Episode-level metadata from the episode database
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeMetadata {
    /// AniDB key of this episode
    #[serde(default)]
    pub episode: String,
    #[serde(default)]
    pub episode_number: i32,
    #[serde(default)]
    pub absolute_episode_number: i32,
    #[serde(default)]
    pub season_number: i32,
    #[serde(default)]
    pub title: HashMap<String, String>,
    pub image: Option<String>,
    #[serde(alias = "airdate")]
    pub air_date: Option<String>,
    #[serde(alias = "runtime")]
    pub length: Option<i32>,
    #[serde(alias = "summary")]
    pub overview: Option<String>,
    pub anidb_eid: Option<i64>,
}

impl EpisodeMetadata {
    /// English title, falling back to romaji
    pub fn display_title(&self) -> Option<&str> {
        ["en", "x-jat", "ja"]
            .iter()
            .find_map(|k| self.title.get(*k).map(String::as_str))
            .filter(|t| !t.is_empty())
    }
}

/// Cross-site id mappings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Mappings {
    pub anilist_id: Option<i32>,
    pub mal_id: Option<i32>,
    pub anidb_id: Option<i32>,
    pub kitsu_id: Option<i32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Disagreement between catalogue and AniDB episode counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discrepancy {
    None,
    /// Catalogue has one more episode and AniDB has an `S1`
    CatalogueCountsEpisodeZero,
    /// Catalogue has several more and AniDB has `S1` and `S2`
    CatalogueCountsSpecials,
    AniDbHasMore,
}

/// AniDB view of one catalogue media
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AniDbRecord {
    #[serde(default)]
    pub episodes: HashMap<String, EpisodeMetadata>,
    /// Number of main episodes
    #[serde(default, rename = "episodeCount")]
    pub main_episode_count: i32,
    #[serde(default)]
    pub special_count: i32,
    #[serde(default)]
    pub mappings: Mappings,
}

impl AniDbRecord {
    pub fn episode(&self, key: &str) -> Option<&EpisodeMetadata> {
        self.episodes.get(key)
    }

    pub fn has_episode(&self, key: &str) -> bool {
        self.episodes.contains_key(key)
    }

    /// Absolute-to-seasonal adjustment, from the first main episode
    pub fn offset(&self) -> i32 {
        match self.episodes.get("1") {
            Some(first) if first.absolute_episode_number > 0 => {
                (first.absolute_episode_number - first.episode_number.max(1)).max(0)
            }
            _ => 0,
        }
    }

    /// How the catalogue's episode count disagrees with this record
    pub fn discrepancy(&self, catalogue_count: i32) -> Discrepancy {
        if self.main_episode_count <= 0 || catalogue_count <= 0 {
            return Discrepancy::None;
        }
        let difference = catalogue_count - self.main_episode_count;
        match difference {
            0 => Discrepancy::None,
            d if d < 0 => Discrepancy::AniDbHasMore,
            1 if self.has_episode("S1") => Discrepancy::CatalogueCountsEpisodeZero,
            d if d > 1 && self.has_episode("S1") && self.has_episode("S2") => {
                Discrepancy::CatalogueCountsSpecials
            }
            _ => Discrepancy::None,
        }
    }

    /// The catalogue counts episode 0 as main while AniDB files it as `S1`
    pub fn has_discrepancy(&self, catalogue_count: i32) -> bool {
        self.discrepancy(catalogue_count) == Discrepancy::CatalogueCountsEpisodeZero
    }

    /// Main episode keys in numeric order
    pub fn main_keys(&self) -> Vec<String> {
        let mut numbers: Vec<i32> = self
            .episodes
            .keys()
            .filter_map(|k| k.parse::<i32>().ok())
            .collect();
        numbers.sort_unstable();
        numbers.into_iter().map(|n| n.to_string()).collect()
    }
}

/// Per-episode records keyed by catalogue id
#[async_trait]
pub trait EpisodeDb: Send + Sync + 'static {
    async fn media(&self, platform: Platform, id: i32) -> Result<AniDbRecord>;
}

/// ani.zip HTTP client
pub struct AnizipClient {
    http: RateLimitedClient,
    base_url: String,
}

impl AnizipClient {
    pub fn new(base_url: impl Into<String>, limiter: RateLimiter) -> Result<Self> {
        Ok(Self {
            http: RateLimitedClient::new(limiter)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl EpisodeDb for AnizipClient {
    async fn media(&self, platform: Platform, id: i32) -> Result<AniDbRecord> {
        let url = format!("{}/mappings", self.base_url.trim_end_matches('/'));
        debug!(platform = %platform, id, "Fetching episode records");

        let response = self
            .http
            .get_with_query(&url, &[(platform.query_key(), id.to_string())])
            .await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Episode database request failed with status: {}",
                response.status()
            );
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse episode records for {} {}", platform, id))
    }
}
