//! Catalogue data model (AniList shapes)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaFormat {
    Tv,
    TvShort,
    Movie,
    Special,
    Ova,
    Ona,
    Music,
    #[serde(other)]
    Unknown,
}

impl MediaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tv => "TV",
            Self::TvShort => "TV_SHORT",
            Self::Movie => "MOVIE",
            Self::Special => "SPECIAL",
            Self::Ova => "OVA",
            Self::Ona => "ONA",
            Self::Music => "MUSIC",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Formats the relation crawler follows
    pub fn is_anime_entry(&self) -> bool {
        matches!(
            self,
            Self::Tv | Self::TvShort | Self::Special | Self::Movie | Self::Ova | Self::Ona
        )
    }
}

impl std::fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    Finished,
    Releasing,
    NotYetReleased,
    Cancelled,
    Hiatus,
    #[serde(other)]
    Unknown,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Releasing => "RELEASING",
            Self::NotYetReleased => "NOT_YET_RELEASED",
            Self::Cancelled => "CANCELLED",
            Self::Hiatus => "HIATUS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of an entry in the user's list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListStatus {
    Current,
    Planning,
    Completed,
    Dropped,
    Paused,
    Repeating,
}

impl ListStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "CURRENT",
            Self::Planning => "PLANNING",
            Self::Completed => "COMPLETED",
            Self::Dropped => "DROPPED",
            Self::Paused => "PAUSED",
            Self::Repeating => "REPEATING",
        }
    }

    /// `Repeating` is presented together with `Current`
    pub fn folded(self) -> Self {
        match self {
            Self::Repeating => Self::Current,
            other => other,
        }
    }
}

impl std::fmt::Display for ListStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    Adaptation,
    Prequel,
    Sequel,
    Parent,
    SideStory,
    Character,
    Summary,
    Alternative,
    SpinOff,
    Other,
    Source,
    Compilation,
    Contains,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
    pub native: Option<String>,
    pub user_preferred: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextAiring {
    pub episode: i32,
    pub airing_at: i64,
    #[serde(default)]
    pub time_until_airing: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverImage {
    pub extra_large: Option<String>,
    pub large: Option<String>,
    pub medium: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuzzyDate {
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub day: Option<i32>,
}

/// Edge target; relations only carry ids, never owned media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub id: i32,
    pub format: Option<MediaFormat>,
    pub status: Option<MediaStatus>,
    #[serde(default)]
    pub title: Option<MediaTitle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaEdge {
    pub relation_type: Option<RelationType>,
    pub node: Option<MediaRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaConnection {
    #[serde(default)]
    pub edges: Vec<MediaEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: i32,
    #[serde(default)]
    pub id_mal: Option<i32>,
    #[serde(default)]
    pub title: MediaTitle,
    #[serde(default)]
    pub synonyms: Option<Vec<String>>,
    pub format: Option<MediaFormat>,
    pub status: Option<MediaStatus>,
    pub episodes: Option<i32>,
    #[serde(default)]
    pub next_airing_episode: Option<NextAiring>,
    #[serde(default)]
    pub season_year: Option<i32>,
    #[serde(default)]
    pub start_date: Option<FuzzyDate>,
    #[serde(default)]
    pub cover_image: Option<CoverImage>,
    #[serde(default)]
    pub banner_image: Option<String>,
    #[serde(default)]
    pub relations: Option<MediaConnection>,
}

impl Media {
    /// Minimal media record with a romaji title; other fields empty
    pub fn new(id: i32, romaji: impl Into<String>) -> Self {
        Self {
            id,
            id_mal: None,
            title: MediaTitle {
                romaji: Some(romaji.into()),
                ..Default::default()
            },
            synonyms: None,
            format: None,
            status: None,
            episodes: None,
            next_airing_episode: None,
            season_year: None,
            start_date: None,
            cover_image: None,
            banner_image: None,
            relations: None,
        }
    }

    /// Episodes released so far: `nextAiring.episode - 1`, else the total, else -1
    pub fn current_episode_count(&self) -> i32 {
        match (&self.next_airing_episode, self.episodes) {
            (Some(next), _) => next.episode - 1,
            (None, Some(total)) => total,
            (None, None) => -1,
        }
    }

    /// Declared total, or -1 when unknown
    pub fn total_episode_count(&self) -> i32 {
        self.episodes.unwrap_or(-1)
    }

    pub fn is_movie(&self) -> bool {
        self.format == Some(MediaFormat::Movie)
    }

    pub fn is_status(&self, status: MediaStatus) -> bool {
        self.status == Some(status)
    }

    pub fn english_title(&self) -> Option<&str> {
        self.title.english.as_deref()
    }

    pub fn romaji_title(&self) -> Option<&str> {
        self.title.romaji.as_deref()
    }

    pub fn preferred_title(&self) -> String {
        self.title
            .user_preferred
            .as_deref()
            .or(self.title.romaji.as_deref())
            .or(self.title.english.as_deref())
            .unwrap_or_default()
            .to_string()
    }

    pub fn synonyms(&self) -> &[String] {
        self.synonyms.as_deref().unwrap_or(&[])
    }

    /// English, romaji and synonyms, skipping empty values
    pub fn all_titles(&self) -> Vec<&str> {
        self.english_title()
            .into_iter()
            .chain(self.romaji_title())
            .chain(self.synonyms().iter().map(String::as_str))
            .filter(|t| !t.trim().is_empty())
            .collect()
    }

    pub fn cover_image_url(&self) -> Option<&str> {
        self.cover_image
            .as_ref()
            .and_then(|c| c.extra_large.as_deref().or(c.large.as_deref()))
    }

    /// Relation edges with both a type and a target
    pub fn relation_edges(&self) -> impl Iterator<Item = (RelationType, &MediaRef)> {
        self.relations
            .iter()
            .flat_map(|r| r.edges.iter())
            .filter_map(|e| Some((e.relation_type?, e.node.as_ref()?)))
    }

    /// Copy of this media without relation edges
    pub fn to_ref(&self) -> MediaRef {
        MediaRef {
            id: self.id,
            format: self.format,
            status: self.status,
            title: Some(self.title.clone()),
        }
    }
}

/// One entry in the user's list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    #[serde(default)]
    pub id: i32,
    pub status: Option<ListStatus>,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub repeat: Option<i32>,
    pub media: Media,
}

impl ListEntry {
    pub fn media_id(&self) -> i32 {
        self.media.id
    }

    pub fn progress(&self) -> i32 {
        self.progress.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListGroup {
    pub status: Option<ListStatus>,
    #[serde(default)]
    pub entries: Vec<ListEntry>,
}

/// The user's anime collection grouped by list status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimeCollection {
    #[serde(default)]
    pub lists: Vec<ListGroup>,
}

impl AnimeCollection {
    pub fn entries(&self) -> impl Iterator<Item = &ListEntry> {
        self.lists.iter().flat_map(|l| l.entries.iter())
    }

    pub fn find_entry(&self, media_id: i32) -> Option<&ListEntry> {
        self.entries().find(|e| e.media.id == media_id)
    }

    pub fn contains(&self, media_id: i32) -> bool {
        self.find_entry(media_id).is_some()
    }

    pub fn all_media(&self) -> Vec<Media> {
        self.entries().map(|e| e.media.clone()).collect()
    }

    /// Entries grouped by status with `Repeating` folded into `Current`
    pub fn grouped(&self) -> Vec<(ListStatus, Vec<&ListEntry>)> {
        let order = [
            ListStatus::Current,
            ListStatus::Planning,
            ListStatus::Completed,
            ListStatus::Paused,
            ListStatus::Dropped,
        ];
        order
            .iter()
            .map(|status| {
                let entries = self
                    .entries()
                    .filter(|e| e.status.map(ListStatus::folded) == Some(*status))
                    .collect();
                (*status, entries)
            })
            .collect()
    }

    /// Apply a progress change locally after a successful remote write
    pub fn set_progress(&mut self, media_id: i32, progress: i32, status: Option<ListStatus>) {
        for entry in self.lists.iter_mut().flat_map(|l| l.entries.iter_mut()) {
            if entry.media.id == media_id {
                entry.progress = Some(progress);
                if status.is_some() {
                    entry.status = status;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: i32, episodes: Option<i32>) -> Media {
        let mut m = Media::new(id, format!("Romaji {id}"));
        m.title.english = Some(format!("English {id}"));
        m.synonyms = Some(vec!["Alias".to_string(), " ".to_string()]);
        m.format = Some(MediaFormat::Tv);
        m.status = Some(MediaStatus::Finished);
        m.episodes = episodes;
        m
    }

    #[test]
    fn test_current_episode_count() {
        let mut m = media(1, Some(12));
        assert_eq!(m.current_episode_count(), 12);

        m.next_airing_episode = Some(NextAiring {
            episode: 11,
            airing_at: 0,
            time_until_airing: None,
        });
        assert_eq!(m.current_episode_count(), 10);

        let unknown = media(2, None);
        assert_eq!(unknown.current_episode_count(), -1);
    }

    #[test]
    fn test_all_titles_skips_blank_synonyms() {
        let m = media(3, Some(1));
        assert_eq!(m.all_titles(), vec!["English 3", "Romaji 3", "Alias"]);
    }

    #[test]
    fn test_repeating_folds_into_current() {
        let mut entry = ListEntry {
            id: 1,
            status: Some(ListStatus::Repeating),
            progress: Some(2),
            score: None,
            repeat: None,
            media: media(5, Some(12)),
        };
        let collection = AnimeCollection {
            lists: vec![ListGroup {
                status: Some(ListStatus::Repeating),
                entries: vec![entry.clone()],
            }],
        };
        let grouped = collection.grouped();
        assert_eq!(grouped[0].0, ListStatus::Current);
        assert_eq!(grouped[0].1.len(), 1);

        entry.status = Some(ListStatus::Planning);
        assert_eq!(entry.status.map(ListStatus::folded), Some(ListStatus::Planning));
    }

    #[test]
    fn test_deserialize_anilist_media() {
        let json = r#"{
            "id": 131586,
            "idMal": 48569,
            "title": {"romaji": "86: Eighty Six Part 2", "english": "86 EIGHTY-SIX Part 2"},
            "synonyms": null,
            "format": "TV",
            "status": "FINISHED",
            "episodes": 11,
            "nextAiringEpisode": null,
            "relations": {"edges": [
                {"relationType": "PREQUEL", "node": {"id": 116589, "format": "TV", "status": "FINISHED"}},
                {"relationType": "SOMETHING_NEW", "node": {"id": 1, "format": "NOVEL", "status": "FINISHED"}}
            ]}
        }"#;
        let m: Media = serde_json::from_str(json).unwrap();
        assert_eq!(m.id, 131586);
        assert!(m.synonyms().is_empty());
        let edges: Vec<_> = m.relation_edges().collect();
        assert_eq!(edges[0].0, RelationType::Prequel);
        assert_eq!(edges[1].0, RelationType::Unknown);
        assert_eq!(edges[1].1.format, Some(MediaFormat::Unknown));
    }
}
