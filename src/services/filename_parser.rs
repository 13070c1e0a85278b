//! Filename parser for anime release names
//!
//! Parses filenames like:
//! - "[SubsPlease] 86 - Eighty Six - 20v2 (1080p).mkv"
//! - "[Judas] Vinland Saga S02E05 [1080p][HEVC x265 10bit].mkv"
//! - "Mushoku.Tensei.S02E00.1080p.WEB-DL.x264-GRP.mkv"
//! - "[Group] Title 2nd Season - 01-12 [Batch]"
//!
//! The parser never fails: fields that cannot be recognised stay empty.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Parsed release information from a file or folder name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedName {
    pub original: String,
    pub title: Option<String>,
    pub release_group: Option<String>,
    pub season: Option<u32>,
    pub part: Option<u32>,
    /// One entry for a single episode, two for a range such as `01-12`
    pub episode_numbers: Vec<u32>,
    pub episode_title: Option<String>,
    pub year: Option<u32>,
    pub resolution: Option<String>,
    pub source: Option<String>,
    pub video_term: Option<String>,
    pub audio_term: Option<String>,
    pub release_version: Option<u32>,
    pub checksum: Option<String>,
    pub extension: Option<String>,
    pub is_batch: bool,
}

impl ParsedName {
    /// The episode number when exactly one was found
    pub fn episode(&self) -> Option<u32> {
        match self.episode_numbers.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    /// `(first, last)` when the name carries an episode range
    pub fn episode_range(&self) -> Option<(u32, u32)> {
        match self.episode_numbers.as_slice() {
            [first, last] => Some((*first, *last)),
            _ => None,
        }
    }
}

static EXTENSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(mkv|mp4|avi|m4v|mov|wmv|flv|webm|ts|m2ts|ogm|srt|ass)$").unwrap()
});
static BRACKET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]*)\]|\(([^)]*)\)|\{([^}]*)\}|【([^】]*)】").unwrap());
static SCENE_GROUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-([A-Za-z0-9]+)$").unwrap());
static RESOLUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{3,4}[pi]|\d{3,4}x\d{3,4}|4k|uhd)\b").unwrap()
});
static SOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bd|bdrip|blu-?ray|bdmv|web-?dl|web-?rip|web|hdtv|dvd|dvdrip|tv-?rip)\b")
        .unwrap()
});
static VIDEO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(x\.?264|x\.?265|h\.?264|h\.?265|hevc|avc|av1|xvid|10-?bit|8-?bit|hi10p?)\b")
        .unwrap()
});
static AUDIO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(aac(?:\d\.\d)?|flac|ac3|e-?ac-?3|dts(?:-hd)?|opus|truehd|dd\+?\d\.\d|ddp\d?(?:\.\d)?|mp3|dual[- ]audio)\b")
        .unwrap()
});
static CHECKSUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{8}$").unwrap());
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(19\d{2}|20\d{2})$").unwrap());
static TRAILING_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s(19\d{2}|20\d{2})$").unwrap());
static BATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(batch|complete|seasons)\b|\+\s?(ova|oad|specials?)\b|\bS\d{1,2}\s?[-~]\s?S\d{1,2}\b")
        .unwrap()
});
static SEASON_EPISODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})\s?E(\d{1,4})(?:\s?-\s?E?(\d{1,4}))?(?:v(\d))?\b").unwrap()
});
static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)(\d{1,4})(?:-|\s?~\s?)(\d{1,4})(?:v\d)?(?:\s|$)").unwrap()
});
static DASH_EPISODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s-\s(\d{1,4})(?:\.\d)?(?:v(\d))?(?:\s|$)").unwrap());
static MARKER_EPISODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)(?:E|EP|Ep\.|Episode|#|SP|OVA|OAD|ONA|NCOP|NCED|OP|ED|Specials?)\s?(\d{1,4})(?:v(\d))?(?:\s|$)")
        .unwrap()
});
/// Unnumbered extras such as `Title - NCED`
static BARE_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s-\s(?:NCOP|NCED|OP|ED|SP|OVA|OAD|(?i:creditless|opening|ending|specials?|extras?))(?:\s|$)")
        .unwrap()
});
static TRAILING_EPISODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s(\d{1,4})(?:v(\d))?$").unwrap());
static SEASON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})\b|\bSeason\s?(\d{1,2})\b|\b(\d{1,2})(?:st|nd|rd|th)\s+Season\b")
        .unwrap()
});
static PART_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:Part|Cour)\s?(\d{1,2})\b").unwrap());
static ORDINAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\d{1,2}(?:st|nd|rd|th)$").unwrap());
static ROMAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s(II|III|IV|V|VI|VII|VIII|IX|X)$").unwrap());
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NON_ALNUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").unwrap());

/// Words that make a trailing number part of the title rather than an episode
const NUMBER_PREFIXES: &[&str] = &["season", "part", "cour", "vol", "volume"];

/// Parse a release name
pub fn parse(filename: &str) -> ParsedName {
    let mut result = ParsedName {
        original: filename.to_string(),
        ..Default::default()
    };

    let mut name = filename.trim().to_string();
    if let Some(caps) = EXTENSION_RE.captures(&name) {
        result.extension = Some(caps[1].to_lowercase());
        name.truncate(caps.get(0).map_or(name.len(), |m| m.start()));
    }

    // Technical terms can sit inside or outside brackets
    result.resolution = RESOLUTION_RE.captures(&name).map(|c| normalize_resolution(&c[1]));
    result.source = SOURCE_RE.captures(&name).map(|c| c[1].to_string());
    result.video_term = VIDEO_RE.captures(&name).map(|c| c[1].to_string());
    result.audio_term = AUDIO_RE.captures(&name).map(|c| c[1].to_string());
    result.is_batch = BATCH_RE.is_match(&name);

    let working = strip_brackets(&name, &mut result);
    let mut working = normalize_separators(&working, &mut result);

    // Everything after the first technical token is noise for title purposes
    if let Some(cut) = first_technical_token(&working) {
        working.truncate(cut);
    }
    let working = SPACES_RE.replace_all(working.trim(), " ").to_string();

    let title_end = extract_episode(&working, &mut result);
    let mut title = working[..title_end].to_string();

    if result.season.is_none() {
        if let Some(caps) = SEASON_RE.captures(&title) {
            result.season = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .and_then(|m| m.as_str().parse().ok());
            let range = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            title.replace_range(range, " ");
        }
    }

    result.part = PART_RE.captures(&title).and_then(|c| c[1].parse().ok());

    if result.year.is_none() {
        if let Some(caps) = TRAILING_YEAR_RE.captures(&title) {
            let start = caps.get(0).map_or(title.len(), |m| m.start());
            if start > 0 {
                result.year = caps[1].parse().ok();
                title.truncate(start);
            }
        }
    }

    let title = clean_title(&title);

    if result.season.is_none() {
        if let Some(caps) = ROMAN_RE.captures(&title) {
            result.season = roman_to_int(&caps[1]);
        }
    }

    if !title.is_empty() {
        result.title = Some(title);
    }

    trace!(
        filename = filename,
        title = ?result.title,
        season = ?result.season,
        episodes = ?result.episode_numbers,
        group = ?result.release_group,
        "Parsed release name"
    );

    result
}

/// Remove bracketed sections, classifying their content
fn strip_brackets(name: &str, result: &mut ParsedName) -> String {
    let mut working = String::with_capacity(name.len());
    let mut last = 0;

    for caps in BRACKET_RE.captures_iter(name) {
        let Some(whole) = caps.get(0) else { continue };
        let content = caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim())
            .unwrap_or("");

        working.push_str(&name[last..whole.start()]);
        working.push(' ');
        last = whole.end();

        let leading = name[..whole.start()].trim().is_empty();
        if CHECKSUM_RE.is_match(content) {
            result.checksum = Some(content.to_uppercase());
        } else if YEAR_RE.is_match(content) {
            result.year = content.parse().ok();
        } else if leading
            && !content.is_empty()
            && result.release_group.is_none()
            && !is_technical(content)
        {
            result.release_group = Some(content.to_string());
        }
    }
    working.push_str(&name[last..]);
    working
}

/// Scene names use dots or underscores instead of spaces
fn normalize_separators(working: &str, result: &mut ParsedName) -> String {
    let mut working = working.trim().to_string();
    if !working.contains(' ') {
        if result.release_group.is_none() {
            if let Some(caps) = SCENE_GROUP_RE.captures(&working) {
                result.release_group = Some(caps[1].to_string());
                let start = caps.get(0).map_or(working.len(), |m| m.start());
                working.truncate(start);
            }
        }
        working = working.replace(['.', '_'], " ");
    } else {
        working = working.replace('_', " ");
    }
    working
}

fn first_technical_token(working: &str) -> Option<usize> {
    [&*RESOLUTION_RE, &*SOURCE_RE, &*VIDEO_RE, &*AUDIO_RE]
        .iter()
        .filter_map(|re| re.find(working).map(|m| m.start()))
        .min()
}

fn is_technical(content: &str) -> bool {
    RESOLUTION_RE.is_match(content)
        || SOURCE_RE.is_match(content)
        || VIDEO_RE.is_match(content)
        || AUDIO_RE.is_match(content)
}

/// Find episode numbers; returns where the title ends
fn extract_episode(working: &str, result: &mut ParsedName) -> usize {
    if let Some(caps) = SEASON_EPISODE_RE.captures(working) {
        result.season = caps[1].parse().ok();
        result.episode_numbers.extend(caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()));
        result.episode_numbers.extend(caps.get(3).and_then(|m| m.as_str().parse::<u32>().ok()));
        result.release_version = caps.get(4).and_then(|m| m.as_str().parse().ok());
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        set_episode_title(working, whole.end, result);
        return whole.start;
    }

    if let Some(caps) = RANGE_RE.captures(working) {
        let first: u32 = caps[1].parse().unwrap_or(0);
        let last: u32 = caps[2].parse().unwrap_or(0);
        let start = caps.get(0).map_or(0, |m| m.start());
        if last > first && start > 0 && !follows_number_prefix(working, start) {
            result.episode_numbers = vec![first, last];
            result.is_batch = true;
            return start;
        }
    }

    if let Some(caps) = DASH_EPISODE_RE.captures(working) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole.start > 0 {
            result.episode_numbers.extend(caps[1].parse::<u32>().ok());
            result.release_version = caps.get(2).and_then(|m| m.as_str().parse().ok());
            set_episode_title(working, whole.end, result);
            return whole.start;
        }
    }

    if let Some(caps) = MARKER_EPISODE_RE.captures(working) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        result.episode_numbers.extend(caps[1].parse::<u32>().ok());
        result.release_version = caps.get(2).and_then(|m| m.as_str().parse().ok());
        set_episode_title(working, whole.end, result);
        return whole.start;
    }

    if let Some(m) = BARE_MARKER_RE.find(working) {
        if m.start() > 0 {
            return m.start();
        }
    }

    if let Some(caps) = TRAILING_EPISODE_RE.captures(working) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let number = &caps[1];
        let looks_like_year = number.len() == 4 && YEAR_RE.is_match(number);
        if whole.start > 0 && !looks_like_year && !follows_number_prefix(working, whole.start) {
            result.episode_numbers.extend(number.parse::<u32>().ok());
            result.release_version = caps.get(2).and_then(|m| m.as_str().parse().ok());
            return whole.start;
        }
    }

    working.len()
}

/// `Season 2` keeps its number, `2nd Season 05` does not
fn follows_number_prefix(working: &str, at: usize) -> bool {
    let mut words = working[..at].split_whitespace().rev();
    let previous_word = words.next().unwrap_or("").to_lowercase();
    if previous_word == "season" && words.next().is_some_and(|w| ORDINAL_RE.is_match(w)) {
        return false;
    }
    NUMBER_PREFIXES.contains(&previous_word.as_str())
}

fn set_episode_title(working: &str, from: usize, result: &mut ParsedName) {
    let rest = working[from.min(working.len())..]
        .trim()
        .trim_start_matches('-')
        .trim();
    if !rest.is_empty() {
        result.episode_title = Some(rest.to_string());
    }
}

fn clean_title(title: &str) -> String {
    let collapsed = SPACES_RE.replace_all(title, " ");
    collapsed
        .trim_matches(|c: char| c.is_whitespace() || c == '-' || c == '_' || c == '.' || c == '~')
        .to_string()
}

fn normalize_resolution(raw: &str) -> String {
    let lower = raw.to_lowercase();
    match lower.as_str() {
        "4k" | "uhd" => "2160p".to_string(),
        _ => match lower.split_once('x') {
            Some((_, height)) => format!("{}p", height),
            None => lower,
        },
    }
}

fn roman_to_int(numeral: &str) -> Option<u32> {
    Some(match numeral {
        "II" => 2,
        "III" => 3,
        "IV" => 4,
        "V" => 5,
        "VI" => 6,
        "VII" => 7,
        "VIII" => 8,
        "IX" => 9,
        "X" => 10,
        _ => return None,
    })
}

/// Lowercase, strip punctuation and collapse whitespace for title comparison
pub fn normalize_title(name: &str) -> String {
    let lower = name.to_lowercase();
    let stripped = NON_ALNUM_RE.replace_all(&lower, " ");
    SPACES_RE.replace_all(stripped.trim(), " ").to_string()
}

/// Sørensen–Dice coefficient over character bigrams of the normalized titles
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_title(a), normalize_title(b));
    if a == b {
        return 1.0;
    }
    strsim::sorensen_dice(&a, &b)
}

/// Levenshtein similarity in `[0, 1]` over the normalized titles
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_title(a), normalize_title(b));
    strsim::normalized_levenshtein(&a, &b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_subsplease_absolute_episode() {
        let result = parse("[SubsPlease] 86 - Eighty Six - 20v2 (1080p).mkv");
        assert_eq!(result.release_group.as_deref(), Some("SubsPlease"));
        assert_eq!(result.title.as_deref(), Some("86 - Eighty Six"));
        assert_eq!(result.episode_numbers, vec![20]);
        assert_eq!(result.release_version, Some(2));
        assert_eq!(result.resolution.as_deref(), Some("1080p"));
        assert_eq!(result.extension.as_deref(), Some("mkv"));
    }

    #[test]
    fn test_parse_season_episode_fields() {
        let result = parse("[ReleaseGroup] Vinland Saga S02E05 [1080p].mkv");
        assert_eq!(result.title.as_deref(), Some("Vinland Saga"));
        assert_eq!(result.season, Some(2));
        assert_eq!(result.episode(), Some(5));
        assert_eq!(result.resolution.as_deref(), Some("1080p"));
        assert_eq!(result.release_group.as_deref(), Some("ReleaseGroup"));
    }

    #[test]
    fn test_parse_scene_style() {
        let result = parse("Mushoku.Tensei.S02E00.1080p.WEB-DL.x264-GRP.mkv");
        assert_eq!(result.title.as_deref(), Some("Mushoku Tensei"));
        assert_eq!(result.season, Some(2));
        assert_eq!(result.episode(), Some(0));
        assert_eq!(result.release_group.as_deref(), Some("GRP"));
        assert_eq!(result.video_term.as_deref(), Some("x264"));
    }

    #[test]
    fn test_parse_batch_range() {
        let result = parse("[Group] Kimetsu no Yaiba 2nd Season 01-12 [Batch] [720p]");
        assert_eq!(result.title.as_deref(), Some("Kimetsu no Yaiba"));
        assert_eq!(result.season, Some(2));
        assert_eq!(result.episode_range(), Some((1, 12)));
        assert!(result.is_batch);
        assert_eq!(result.resolution.as_deref(), Some("720p"));
    }

    #[test]
    fn test_parse_season_word_and_episode_title() {
        let result = parse("[Erai-raws] Oshi no Ko Season 2 - 03 - Tokyo Blade [1080p][ABCD1234].mkv");
        assert_eq!(result.title.as_deref(), Some("Oshi no Ko"));
        assert_eq!(result.season, Some(2));
        assert_eq!(result.episode(), Some(3));
        assert_eq!(result.episode_title.as_deref(), Some("Tokyo Blade"));
        assert_eq!(result.checksum.as_deref(), Some("ABCD1234"));
    }

    #[test]
    fn test_roman_numeral_season_only_without_marker() {
        let result = parse("[Group] Overlord II - 05.mkv");
        assert_eq!(result.title.as_deref(), Some("Overlord II"));
        assert_eq!(result.season, Some(2));

        let explicit = parse("[Group] Overlord II S03E01.mkv");
        assert_eq!(explicit.season, Some(3));
    }

    #[test]
    fn test_parse_nc_marker() {
        let result = parse("[Group] Jujutsu Kaisen - NCOP2 [1080p].mkv");
        assert_eq!(result.title.as_deref(), Some("Jujutsu Kaisen"));
        assert_eq!(result.episode(), Some(2));
    }

    #[test]
    fn test_parse_unnumbered_extras_end_the_title() {
        let ending = parse("[Group] Frieren - NCED [BD].mkv");
        assert_eq!(ending.title.as_deref(), Some("Frieren"));
        assert!(ending.episode_numbers.is_empty());

        let creditless = parse("[Group] Sousou no Frieren - Creditless [BD].mkv");
        assert_eq!(creditless.title.as_deref(), Some("Sousou no Frieren"));

        let ova = parse("[Group] Mushoku Tensei - OVA.mkv");
        assert_eq!(ova.title.as_deref(), Some("Mushoku Tensei"));
    }

    #[test]
    fn test_parse_ordinal_season_then_episode() {
        let single = parse("[Group] Kimetsu no Yaiba 2nd Season 05 [720p].mkv");
        assert_eq!(single.title.as_deref(), Some("Kimetsu no Yaiba"));
        assert_eq!(single.season, Some(2));
        assert_eq!(single.episode(), Some(5));

        let folder = parse("Sousou no Frieren Season 2");
        assert!(folder.episode_numbers.is_empty());
    }

    #[test]
    fn test_parse_movie_with_year() {
        let result = parse("[Group] Kimi no Na wa (2016) [BD 1080p].mkv");
        assert_eq!(result.title.as_deref(), Some("Kimi no Na wa"));
        assert_eq!(result.year, Some(2016));
        assert!(result.episode_numbers.is_empty());
        assert_eq!(result.source.as_deref(), Some("BD"));
    }

    #[test]
    fn test_parse_folder_name() {
        let result = parse("Sousou no Frieren Season 2");
        assert_eq!(result.title.as_deref(), Some("Sousou no Frieren"));
        assert_eq!(result.season, Some(2));
        assert!(result.episode_numbers.is_empty());
    }

    #[test]
    fn test_parser_never_fails_on_noise() {
        for input in ["", "   ", "[]", "().mkv", "-", "[A][B][C]"] {
            let result = parse(input);
            assert!(result.episode_numbers.is_empty());
        }
    }

    #[test]
    fn test_title_similarity() {
        assert!(dice_similarity("86 - Eighty Six", "86 Eighty Six") > 0.99);
        assert!(dice_similarity("86 - Eighty Six", "86 Eighty Six Part 2") > 0.7);
        assert!(dice_similarity("Bocchi the Rock!", "Oshi no Ko") < 0.3);
        assert!(levenshtein_similarity("Frieren", "Frieren") > 0.99);
    }
}
