//! Sequel/prequel crawler
//!
//! Walks relation edges from a starting media and collects every reachable
//! season into an id-keyed map. Nodes are fetched level by level with bounded
//! concurrency; ids already in the tree are never fetched twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tracing::{debug, warn};

use super::anilist::{Catalogue, Media, RelationType};
use super::cache::ResultCache;

/// Which edges a branch keeps following
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Both,
    Prequels,
    Sequels,
}

impl Direction {
    /// Direction after following `relation` from a node heading `self`
    fn follow(self, relation: RelationType) -> Option<Direction> {
        match (self, relation) {
            (Direction::Both | Direction::Prequels, RelationType::Prequel) => {
                Some(Direction::Prequels)
            }
            (Direction::Both | Direction::Sequels, RelationType::Sequel) => {
                Some(Direction::Sequels)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationTreeConfig {
    /// Maximum number of media in one tree
    pub max_nodes: usize,
    /// Concurrent catalogue fetches per level
    pub concurrency: usize,
}

impl Default for RelationTreeConfig {
    fn default() -> Self {
        Self {
            max_nodes: 30,
            concurrency: 4,
        }
    }
}

/// Crawls relations through the catalogue, sharing a cache of complete media
#[derive(Clone)]
pub struct RelationTreeBuilder {
    catalogue: Arc<dyn Catalogue>,
    cache: ResultCache<i32, Media>,
    config: RelationTreeConfig,
}

impl RelationTreeBuilder {
    pub fn new(catalogue: Arc<dyn Catalogue>, cache: ResultCache<i32, Media>) -> Self {
        Self {
            catalogue,
            cache,
            config: RelationTreeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelationTreeConfig) -> Self {
        self.config = config;
        self
    }

    /// Media with its relation edges, fetched once per id
    pub async fn complete_media(&self, id: i32) -> Result<Media> {
        let catalogue = self.catalogue.clone();
        self.cache
            .get_or_compute(id, move || async move { catalogue.media_by_id(id).await })
            .await
    }

    /// Every season reachable from `start` by monotone sequel/prequel edges,
    /// `start` included.
    pub async fn build(&self, start: &Media) -> Result<HashMap<i32, Media>> {
        let root = if start.relations.is_some() {
            start.clone()
        } else {
            self.complete_media(start.id).await?
        };

        let mut tree = HashMap::new();
        let mut visited = HashSet::from([root.id]);
        let mut frontier = self.next_edges(&root, Direction::Both, &mut visited);
        tree.insert(root.id, root);

        while !frontier.is_empty() {
            let fetched: Vec<_> = futures::stream::iter(frontier)
                .map(|(id, direction)| async move { (id, direction, self.complete_media(id).await) })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            frontier = Vec::new();
            for (id, direction, result) in fetched {
                match result {
                    Ok(media) => {
                        frontier.extend(self.next_edges(&media, direction, &mut visited));
                        tree.insert(id, media);
                    }
                    Err(e) => {
                        warn!(media_id = id, error = %e, "Failed to fetch related media");
                    }
                }
            }
        }

        debug!(start = start.id, size = tree.len(), "Relation tree built");
        Ok(tree)
    }

    fn next_edges(
        &self,
        media: &Media,
        direction: Direction,
        visited: &mut HashSet<i32>,
    ) -> Vec<(i32, Direction)> {
        let mut next = Vec::new();
        for (relation, target) in media.relation_edges() {
            if visited.len() >= self.config.max_nodes {
                break;
            }
            let Some(next_direction) = direction.follow(relation) else {
                continue;
            };
            if !target.format.is_some_and(|f| f.is_anime_entry()) {
                continue;
            }
            if visited.insert(target.id) {
                next.push((target.id, next_direction));
            }
        }
        next
    }
}

/// Seasons of a tree in chronological order, prequel chain first
pub fn ordered_seasons(tree: &HashMap<i32, Media>, start_id: i32) -> Vec<i32> {
    let step = |id: i32, relation: RelationType| -> Option<i32> {
        tree.get(&id)?
            .relation_edges()
            .find(|(r, m)| *r == relation && tree.contains_key(&m.id))
            .map(|(_, m)| m.id)
    };

    let mut earliest = start_id;
    let mut seen = HashSet::from([start_id]);
    while let Some(prev) = step(earliest, RelationType::Prequel) {
        if !seen.insert(prev) {
            break;
        }
        earliest = prev;
    }

    let mut order = vec![earliest];
    let mut seen = HashSet::from([earliest]);
    let mut current = earliest;
    while let Some(next) = step(current, RelationType::Sequel) {
        if !seen.insert(next) {
            break;
        }
        order.push(next);
        current = next;
    }
    order
}
