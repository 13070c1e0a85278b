//! Catalogue lookups that feed the media container

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::anilist::{AnimeCollection, Catalogue, Media};
use crate::services::local_file::{LocalFile, unique_titles};
use crate::services::relation_tree::RelationTreeBuilder;

/// Concurrent title searches during an enhanced fetch
const SEARCH_CONCURRENCY: usize = 4;

/// Everything the matcher may assign files to
#[derive(Debug, Default)]
pub struct FetchedMedia {
    pub collection: AnimeCollection,
    pub media: Vec<Media>,
}

pub struct MediaFetcher {
    catalogue: Arc<dyn Catalogue>,
    tree: RelationTreeBuilder,
}

impl MediaFetcher {
    pub fn new(catalogue: Arc<dyn Catalogue>, tree: RelationTreeBuilder) -> Self {
        Self { catalogue, tree }
    }

    /// Fetch the user's collection and, when `enhanced`, every season related
    /// to a title found among `files`. Only the collection fetch is fatal.
    pub async fn fetch(
        &self,
        files: &[LocalFile],
        enhanced: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchedMedia> {
        let collection = self
            .catalogue
            .user_collection()
            .await
            .context("Failed to fetch the user collection")?;

        let mut media: HashMap<i32, Media> = collection
            .all_media()
            .into_iter()
            .map(|m| (m.id, m))
            .collect();
        debug!(count = media.len(), "Collection media loaded");

        if enhanced && !cancel.is_cancelled() {
            let discovered = self.discover(files, cancel).await;
            let before = media.len();
            for m in discovered {
                // Complete media carries relations; collection copies do not
                media.insert(m.id, m);
            }
            info!(added = media.len() - before, total = media.len(), "Enhanced fetch finished");
        }

        Ok(FetchedMedia {
            collection,
            media: media.into_values().collect(),
        })
    }

    /// Search each parsed title and expand every hit into its relation tree
    async fn discover(&self, files: &[LocalFile], cancel: &CancellationToken) -> Vec<Media> {
        let titles = unique_titles(files);
        debug!(titles = titles.len(), "Searching catalogue for parsed titles");

        let trees: Vec<Vec<Media>> = futures::stream::iter(titles)
            .map(|title| async move {
                if cancel.is_cancelled() {
                    return Vec::new();
                }
                self.discover_title(&title).await
            })
            .buffer_unordered(SEARCH_CONCURRENCY)
            .collect()
            .await;

        trees.into_iter().flatten().collect()
    }

    async fn discover_title(&self, title: &str) -> Vec<Media> {
        let ids = match self.catalogue.search_ids(title).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(title, error = %e, "Catalogue search failed");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for id in ids {
            let start = match self.tree.complete_media(id).await {
                Ok(media) => media,
                Err(e) => {
                    warn!(media_id = id, error = %e, "Failed to fetch media");
                    continue;
                }
            };
            match self.tree.build(&start).await {
                Ok(tree) => found.extend(tree.into_values()),
                Err(e) => {
                    warn!(media_id = id, error = %e, "Failed to build relation tree");
                    found.push(start);
                }
            }
        }
        found
    }
}
