//! Indexed view over every media the scanner knows about
//!
//! Built once per scan and read-only afterwards.

use std::collections::{HashMap, HashSet};

use crate::services::anilist::{AnimeCollection, ListStatus, Media};
use crate::services::filename_parser::{self, normalize_title};

/// One searchable title
#[derive(Debug, Clone)]
pub struct TitleEntry {
    pub title: String,
    pub media_id: i32,
}

#[derive(Debug, Default)]
pub struct MediaContainer {
    by_id: HashMap<i32, Media>,
    /// Lowercased english/romaji/synonym -> media ids in insertion order
    exact: HashMap<String, Vec<i32>>,
    eng_titles: Vec<TitleEntry>,
    rom_titles: Vec<TitleEntry>,
    synonyms: Vec<TitleEntry>,
    collection_ids: HashSet<i32>,
    watching_ids: HashSet<i32>,
}

impl MediaContainer {
    pub fn new(media: Vec<Media>, collection: &AnimeCollection) -> Self {
        let mut container = Self {
            collection_ids: collection.entries().map(|e| e.media_id()).collect(),
            watching_ids: collection
                .entries()
                .filter(|e| e.status.map(ListStatus::folded) == Some(ListStatus::Current))
                .map(|e| e.media_id())
                .collect(),
            ..Default::default()
        };

        // Sort for a deterministic index regardless of fetch order
        let mut media = media;
        media.sort_by_key(|m| m.id);
        media.dedup_by_key(|m| m.id);

        for m in media {
            container.index(&m);
            container.by_id.insert(m.id, m);
        }
        container
    }

    fn index(&mut self, media: &Media) {
        let push = |list: &mut Vec<TitleEntry>, exact: &mut HashMap<String, Vec<i32>>, title: &str| {
            if title.trim().is_empty() {
                return;
            }
            list.push(TitleEntry {
                title: title.to_string(),
                media_id: media.id,
            });
            for key in [title.to_lowercase(), normalize_title(title)] {
                let ids = exact.entry(key).or_default();
                if !ids.contains(&media.id) {
                    ids.push(media.id);
                }
            }
        };

        if let Some(eng) = media.english_title() {
            push(&mut self.eng_titles, &mut self.exact, eng);
        }
        if let Some(rom) = media.romaji_title() {
            push(&mut self.rom_titles, &mut self.exact, rom);
        }
        for synonym in media.synonyms() {
            push(&mut self.synonyms, &mut self.exact, synonym);
        }
    }

    pub fn get(&self, id: i32) -> Option<&Media> {
        self.by_id.get(&id)
    }

    pub fn all_media(&self) -> impl Iterator<Item = &Media> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Ids whose english, romaji or synonym equals `title`, ignoring case
    pub fn exact_matches(&self, title: &str) -> &[i32] {
        self.exact
            .get(&title.to_lowercase())
            .or_else(|| self.exact.get(&normalize_title(title)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every indexed title, english first
    pub fn titles(&self) -> impl Iterator<Item = &TitleEntry> {
        self.eng_titles
            .iter()
            .chain(self.rom_titles.iter())
            .chain(self.synonyms.iter())
    }

    pub fn in_collection(&self, id: i32) -> bool {
        self.collection_ids.contains(&id)
    }

    pub fn is_watching(&self, id: i32) -> bool {
        self.watching_ids.contains(&id)
    }

    /// Ids known to the container but absent from the user's list
    pub fn unknown_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .by_id
            .keys()
            .filter(|id| !self.collection_ids.contains(id))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Season a media's titles advertise ("Season 2", "2nd Season", "S2", "II")
    pub fn media_season(&self, id: i32) -> Option<u32> {
        let media = self.get(id)?;
        media
            .all_titles()
            .into_iter()
            .find_map(|t| filename_parser::parse(t).season)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::anilist::{ListEntry, ListGroup};

    fn media(id: i32, english: &str, romaji: &str) -> Media {
        let mut m = Media::new(id, romaji);
        m.title.english = Some(english.to_string());
        m
    }

    fn collection(entries: &[(i32, ListStatus)]) -> AnimeCollection {
        AnimeCollection {
            lists: vec![ListGroup {
                status: None,
                entries: entries
                    .iter()
                    .map(|(id, status)| ListEntry {
                        id: *id,
                        status: Some(*status),
                        progress: None,
                        score: None,
                        repeat: None,
                        media: Media::new(*id, "x"),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_exact_index_is_case_insensitive() {
        let container = MediaContainer::new(
            vec![media(1, "Frieren: Beyond Journey's End", "Sousou no Frieren")],
            &AnimeCollection::default(),
        );
        assert_eq!(container.exact_matches("sousou no frieren"), &[1]);
        assert_eq!(container.exact_matches("Frieren Beyond Journey s End"), &[1]);
        assert!(container.exact_matches("Frieren 2").is_empty());
    }

    #[test]
    fn test_duplicate_titles_keep_every_id() {
        let container = MediaContainer::new(
            vec![media(2, "Hunter x Hunter", "Hunter x Hunter (2011)"), media(1, "Hunter x Hunter", "Hunter x Hunter")],
            &AnimeCollection::default(),
        );
        assert_eq!(container.exact_matches("hunter x hunter"), &[1, 2]);
    }

    #[test]
    fn test_collection_membership() {
        let container = MediaContainer::new(
            vec![media(1, "A", "A"), media(2, "B", "B"), media(3, "C", "C")],
            &collection(&[(1, ListStatus::Repeating), (2, ListStatus::Planning)]),
        );
        assert!(container.in_collection(2));
        assert!(container.is_watching(1));
        assert!(!container.is_watching(2));
        assert_eq!(container.unknown_ids(), vec![3]);
    }

    #[test]
    fn test_media_season_from_title() {
        let container = MediaContainer::new(
            vec![media(5, "Mushoku Tensei: Jobless Reincarnation Season 2", "Mushoku Tensei II")],
            &AnimeCollection::default(),
        );
        assert_eq!(container.media_season(5), Some(2));
    }
}
