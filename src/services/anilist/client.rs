//! AniList GraphQL client
//!
//! Base URL: https://graphql.anilist.co

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::models::{AnimeCollection, ListStatus, Media};
use super::{Catalogue, status_for_progress};
use crate::services::rate_limiter::{
    RateLimitedClient, RateLimiter, ResponseExt, RetryConfig, retry_async,
};

const MEDIA_FIELDS: &str = "id idMal title { romaji english native userPreferred } synonyms \
    format status episodes nextAiringEpisode { episode airingAt timeUntilAiring } seasonYear \
    startDate { year month day } coverImage { extraLarge large medium } bannerImage";

const RELATION_FIELDS: &str = "relations { edges { relationType(version: 2) \
    node { id format status title { romaji english } } } }";

/// AniList API client
pub struct AnilistClient {
    http: RateLimitedClient,
    base_url: String,
    token: Option<String>,
    username: Option<String>,
    viewer: OnceCell<String>,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MediaData {
    media: Option<Media>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CollectionData {
    media_list_collection: Option<AnimeCollection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PageData {
    page: Option<PageMedia>,
}

#[derive(Debug, Deserialize)]
struct PageMedia {
    #[serde(default)]
    media: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ViewerData {
    viewer: Option<Viewer>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    name: String,
}

impl AnilistClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        username: Option<String>,
        limiter: RateLimiter,
    ) -> Result<Self> {
        Ok(Self {
            http: RateLimitedClient::new(limiter)?,
            base_url: base_url.into(),
            token,
            username,
            viewer: OnceCell::new(),
            retry: RetryConfig::default(),
        })
    }

    /// Run a GraphQL document, retrying transient failures
    async fn query<T: DeserializeOwned>(&self, document: &str, variables: Value) -> Result<T> {
        let body = json!({ "query": document, "variables": variables });

        let response = retry_async(
            || async {
                let response = self
                    .http
                    .post_json(&self.base_url, &body, self.token.as_deref())
                    .await?;
                if response.is_transient_error() {
                    anyhow::bail!("AniList request failed with status: {}", response.status());
                }
                Ok(response)
            },
            &self.retry,
            "anilist_query",
        )
        .await?;

        if !response.status().is_success() {
            anyhow::bail!("AniList request failed with status: {}", response.status());
        }

        let parsed: GraphqlResponse<T> = response
            .json()
            .await
            .context("Failed to parse AniList response")?;

        if let Some(error) = parsed.errors.first() {
            anyhow::bail!("AniList returned an error: {}", error.message);
        }

        parsed.data.context("AniList response had no data")
    }

    async fn user_name(&self) -> Result<String> {
        if let Some(name) = &self.username {
            return Ok(name.clone());
        }
        let name = self
            .viewer
            .get_or_try_init(|| async {
                let data: ViewerData = self.query("query { Viewer { name } }", json!({})).await?;
                data.viewer
                    .map(|v| v.name)
                    .context("AniList token is not linked to a user")
            })
            .await?;
        Ok(name.clone())
    }

    async fn save_entry(
        &self,
        media_id: i32,
        progress: Option<i32>,
        status: Option<ListStatus>,
    ) -> Result<()> {
        let document = "mutation ($mediaId: Int, $progress: Int, $status: MediaListStatus) { \
            SaveMediaListEntry(mediaId: $mediaId, progress: $progress, status: $status) { id } }";
        let _: Value = self
            .query(
                document,
                json!({
                    "mediaId": media_id,
                    "progress": progress,
                    "status": status.map(|s| s.as_str()),
                }),
            )
            .await
            .with_context(|| format!("Failed to save list entry for media {}", media_id))?;
        Ok(())
    }
}

#[async_trait]
impl Catalogue for AnilistClient {
    async fn media_by_id(&self, id: i32) -> Result<Media> {
        debug!(media_id = id, "Fetching media from AniList");

        let document = format!(
            "query ($id: Int) {{ Media(id: $id, type: ANIME) {{ {MEDIA_FIELDS} {RELATION_FIELDS} }} }}"
        );
        let data: MediaData = self.query(&document, json!({ "id": id })).await?;
        data.media
            .with_context(|| format!("AniList has no media with id {}", id))
    }

    async fn user_collection(&self) -> Result<AnimeCollection> {
        let user = self.user_name().await?;
        info!(user = %user, "Fetching anime collection from AniList");

        let document = format!(
            "query ($userName: String) {{ MediaListCollection(userName: $userName, type: ANIME) {{ \
             lists {{ status entries {{ id status progress score repeat media {{ {MEDIA_FIELDS} }} }} }} }} }}"
        );
        let data: CollectionData = self.query(&document, json!({ "userName": user })).await?;
        let collection = data.media_list_collection.unwrap_or_default();

        debug!(entries = collection.entries().count(), "AniList collection fetched");
        Ok(collection)
    }

    async fn search_ids(&self, title: &str) -> Result<Vec<i32>> {
        let document = "query ($search: String) { Page(perPage: 8) { \
            media(search: $search, type: ANIME) { id } } }";
        let data: PageData = self.query(document, json!({ "search": title })).await?;
        Ok(data
            .page
            .map(|p| p.media.into_iter().map(|m| m.id).collect())
            .unwrap_or_default())
    }

    async fn update_entry_progress(
        &self,
        media_id: i32,
        progress: i32,
        total_episodes: Option<i32>,
    ) -> Result<()> {
        let status = status_for_progress(progress, total_episodes);
        info!(media_id, progress, status = ?status, "Updating AniList progress");
        self.save_entry(media_id, Some(progress), status).await
    }

    async fn add_to_planning(&self, media_ids: &[i32]) -> Result<()> {
        let mut failures = 0;
        for &media_id in media_ids {
            // Each save waits on the catalogue limiter inside the HTTP wrapper
            if let Err(e) = self.save_entry(media_id, None, Some(ListStatus::Planning)).await {
                warn!(media_id, error = %e, "Failed to add media to planning list");
                failures += 1;
            }
        }
        if failures > 0 && failures == media_ids.len() {
            anyhow::bail!("Failed to add any of {} media to the planning list", failures);
        }
        Ok(())
    }
}
