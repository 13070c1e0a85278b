//! Local file model
//!
//! A [`LocalFile`] is one video on disk plus everything the scanner learned
//! about it. Identity is the path; `media_id == 0` means unmatched.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::filename_parser::{self, ParsedName};

/// Extensions the scanner picks up
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4"];

/// Folder titles that never name a series
const GENERIC_FOLDER_TITLES: &[&str] = &[
    "SPECIALS", "SPECIAL", "EXTRA", "EXTRAS", "NC", "OP", "ED", "MOVIE", "MOVIES", "OVA",
];

static NC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(NCOP\d{0,2}|NCED\d{0,2}|opening|ending|creditless|OP\s?\d{1,2}|ED\s?\d{1,2}|PV\d{0,2}|preview|trailer|menu)\b")
        .unwrap()
});
static SPECIAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(SP\s?\d{0,3}|specials?|OVA|OAD|extras?|bonus|recap|omake)\b").unwrap()
});
static OPENING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(NCOP\d{0,2}|opening|OP\s?\d{1,2})\b").unwrap());
static ENDING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(NCED\d{0,2}|ending|ED\s?\d{1,2})\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalFileKind {
    #[default]
    Main,
    Special,
    Nc,
}

impl LocalFileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "MAIN",
            Self::Special => "SPECIAL",
            Self::Nc => "NC",
        }
    }
}

impl std::fmt::Display for LocalFileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opening/ending flavour of an NC file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcKind {
    Opening,
    Ending,
}

impl NcKind {
    /// AniDB key prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            NcKind::Opening => "OP",
            NcKind::Ending => "ED",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFileMetadata {
    pub episode: i32,
    /// Empty until hydrated
    #[serde(rename = "aniDBEpisode")]
    pub anidb_episode: String,
    #[serde(rename = "type")]
    pub kind: LocalFileKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFile {
    pub path: String,
    pub name: String,
    #[serde(rename = "parsedInfo")]
    pub parsed: ParsedName,
    #[serde(rename = "parsedFolderInfo", default)]
    pub parsed_folders: Vec<ParsedName>,
    pub metadata: LocalFileMetadata,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub media_id: i32,
}

impl LocalFile {
    /// Parse a file and its directories below `library_root`
    pub fn new(path: &Path, library_root: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let parsed_folders = path
            .parent()
            .and_then(|parent| parent.strip_prefix(library_root).ok())
            .map(|relative| {
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .filter(|dir| !dir.is_empty())
                    .map(|dir| filename_parser::parse(&dir))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            path: path.to_string_lossy().into_owned(),
            parsed: filename_parser::parse(&name),
            name,
            parsed_folders,
            metadata: LocalFileMetadata::default(),
            locked: false,
            ignored: false,
            media_id: 0,
        }
    }

    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }

    pub fn has_path(&self, other: &str) -> bool {
        self.normalized_path() == normalize_path(other)
    }

    pub fn is_matched(&self) -> bool {
        self.media_id != 0
    }

    pub fn is_main(&self) -> bool {
        self.metadata.kind == LocalFileKind::Main
    }

    /// Locked and ignored files are kept verbatim across scans
    pub fn is_frozen(&self) -> bool {
        self.locked || self.ignored
    }

    pub fn parsed_episode(&self) -> Option<i32> {
        self.parsed.episode().map(|e| e as i32)
    }

    /// Title of the closest non-generic folder, if any
    pub fn folder_title(&self) -> Option<&str> {
        self.parsed_folders
            .iter()
            .rev()
            .filter_map(|p| p.title.as_deref())
            .find(|t| !is_generic_title(t))
    }

    /// Best single title for this file, folder first
    pub fn parsed_title(&self) -> Option<&str> {
        self.folder_title().or(self.parsed.title.as_deref())
    }

    /// Season from the filename, else from the nearest folder carrying one
    pub fn parsed_season(&self) -> Option<u32> {
        self.parsed
            .season
            .or_else(|| self.parsed_folders.iter().rev().find_map(|p| p.season))
    }

    /// Search variants: bare titles, season and part suffixed forms, and a
    /// punctuation-free copy of each
    pub fn title_variations(&self) -> Vec<String> {
        let file_title = self.parsed.title.as_deref().filter(|t| !is_generic_title(t));
        let folder_title = self.folder_title();
        let folder_season = self.parsed_folders.iter().rev().find_map(|p| p.season);
        let season = self.parsed.season;
        let part = self.parsed.part;

        let mut out: Vec<String> = Vec::new();
        let (file_title, folder_title) = match (file_title, folder_title) {
            (None, None) => return out,
            pair => pair,
        };

        let titles_similar = match (file_title, folder_title) {
            (Some(f), Some(d)) => d.to_lowercase().contains(&f.to_lowercase()),
            _ => false,
        };
        let any_season = season.or(folder_season);
        let plain = any_season.is_none() && part.is_none();
        let first_season = any_season == Some(1);

        if let Some(part) = part {
            for title in folder_title.iter().chain(file_title.iter()) {
                out.push(format!("{title} Part {part}"));
                out.push(format!("{title} Part {}", ordinal(part)));
                out.push(format!("{title} Cour {part}"));
                if let Some(s) = any_season {
                    out.push(format!("{title} Season {s} Part {part}"));
                }
            }
        }

        if plain || first_season {
            if let Some(folder) = folder_title.filter(|_| titles_similar || file_title.is_none()) {
                out.push(folder.to_string());
            }
            if let Some(file) = file_title {
                out.push(file.to_string());
            }
        }

        if let Some(s) = any_season {
            let mut bases = Vec::new();
            match (file_title, folder_title) {
                (Some(file), Some(folder)) => {
                    bases.push(file.to_string());
                    if titles_similar {
                        bases.push(folder.to_string());
                    } else {
                        bases.push(format!("{folder} {file}"));
                    }
                }
                (None, Some(folder)) => bases.push(folder.to_string()),
                (Some(file), None) => bases.push(file.to_string()),
                (None, None) => {}
            }
            for base in bases {
                out.push(format!("{base} Season {s}"));
                out.push(format!("{base} S{s}"));
                out.push(format!("{base} {} Season", ordinal(s)));
            }
        }

        let stripped: Vec<String> = out
            .iter()
            .map(|t| filename_parser::normalize_title(t))
            .collect();
        out.extend(stripped);

        let mut seen = HashSet::new();
        out.retain(|t| !t.is_empty() && seen.insert(t.to_lowercase()));
        out
    }

    /// Filename with the extension and parsed title removed, for keyword checks
    fn keyword_haystack(&self) -> String {
        let stem = Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let without_title = match self.parsed.title.as_deref() {
            Some(title) if !title.is_empty() => stem.replacen(title, " ", 1),
            _ => stem,
        };
        let folder = self
            .parsed_folders
            .last()
            .map(|p| p.original.as_str())
            .unwrap_or_default();
        format!("{} {}", without_title.replace(['_', '.'], " "), folder)
    }

    pub fn is_probably_nc(&self) -> bool {
        NC_RE.is_match(&self.keyword_haystack())
    }

    pub fn is_probably_special(&self) -> bool {
        SPECIAL_RE.is_match(&self.keyword_haystack())
    }

    /// Opening or ending, when the name says which
    pub fn nc_kind(&self) -> Option<NcKind> {
        let haystack = self.keyword_haystack();
        if OPENING_RE.is_match(&haystack) {
            Some(NcKind::Opening)
        } else if ENDING_RE.is_match(&haystack) {
            Some(NcKind::Ending)
        } else {
            None
        }
    }
}

/// Forward slashes and lowercase, for path comparisons
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

fn is_generic_title(title: &str) -> bool {
    GENERIC_FOLDER_TITLES.contains(&title.to_uppercase().as_str())
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// Unique, non-generic titles across files
pub fn unique_titles(files: &[LocalFile]) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .iter()
        .filter_map(|f| f.parsed_title())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Matched files grouped by media id, in id order
pub fn group_by_media(files: &[LocalFile]) -> BTreeMap<i32, Vec<&LocalFile>> {
    let mut groups: BTreeMap<i32, Vec<&LocalFile>> = BTreeMap::new();
    for file in files.iter().filter(|f| f.is_matched()) {
        groups.entry(file.media_id).or_default().push(file);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(relative: &str) -> LocalFile {
        let root = Path::new("/lib");
        LocalFile::new(&root.join(relative), root)
    }

    #[test]
    fn test_new_parses_file_and_folders() {
        let lf = file("Mushoku Tensei/Season 2/[Group] Mushoku Tensei S2 - 03 (1080p).mkv");
        assert_eq!(lf.name, "[Group] Mushoku Tensei S2 - 03 (1080p).mkv");
        assert_eq!(lf.parsed_folders.len(), 2);
        assert_eq!(lf.parsed_episode(), Some(3));
        assert_eq!(lf.parsed_season(), Some(2));
        assert_eq!(lf.media_id, 0);
        assert!(!lf.is_matched());
    }

    #[test]
    fn test_title_variations_with_season() {
        let lf = file("[SubsPlease] Spy x Family S2 - 04 (1080p).mkv");
        let variations = lf.title_variations();
        assert!(variations.contains(&"Spy x Family Season 2".to_string()));
        assert!(variations.contains(&"Spy x Family S2".to_string()));
        assert!(variations.contains(&"Spy x Family 2nd Season".to_string()));
        assert!(!variations.contains(&"Spy x Family".to_string()));
    }

    #[test]
    fn test_title_variations_plain_title() {
        let lf = file("[SubsPlease] Frieren - 05 (1080p).mkv");
        assert_eq!(lf.title_variations(), vec!["Frieren".to_string()]);
    }

    #[test]
    fn test_generic_folder_is_not_a_title() {
        let lf = file("Frieren/Specials/[Group] Frieren - SP1.mkv");
        assert_eq!(lf.folder_title(), Some("Frieren"));
        assert!(lf.is_probably_special());
    }

    #[test]
    fn test_nc_detection() {
        let lf = file("Frieren/[Group] Frieren - NCOP2 (1080p).mkv");
        assert!(lf.is_probably_nc());
        assert_eq!(lf.nc_kind(), Some(NcKind::Opening));

        let ending = file("[Group] Frieren - NCED [BD].mkv");
        assert_eq!(ending.nc_kind(), Some(NcKind::Ending));

        let main = file("[Group] Frieren - 05 (1080p).mkv");
        assert!(!main.is_probably_nc());
        assert!(!main.is_probably_special());
    }

    #[test]
    fn test_normalized_path() {
        assert_eq!(normalize_path(r"C:\Anime\Show\EP01.MKV"), "c:/anime/show/ep01.mkv");
        let lf = file("Show/EP01.mkv");
        assert!(lf.has_path("/LIB/show/ep01.mkv"));
    }

    #[test]
    fn test_group_by_media_skips_unmatched() {
        let mut a = file("a - 01.mkv");
        a.media_id = 5;
        let b = file("b - 01.mkv");
        let mut c = file("a - 02.mkv");
        c.media_id = 5;
        let files = vec![a, b, c];
        let groups = group_by_media(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[&5].len(), 2);
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/a/b.MKV")));
        assert!(is_video_file(Path::new("/a/b.mp4")));
        assert!(!is_video_file(Path::new("/a/b.srt")));
    }
}
