use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::models::ParsedFile;

// Cache for parsed release names (LRU with 10k max entries)
lazy_static! {
    static ref PARSE_CACHE: Mutex<LruCache<String, Option<ParsedFile>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(10000).unwrap()));

    // ============ RESOLUTION / QUALITY / ENCODE ============
    static ref RESOLUTION: Regex =
        Regex::new(r"(?i)\b(4320p|2160p|1440p|1080p|720p|576p|480p|360p)\b").unwrap();
    static ref RESOLUTION_4K: Regex = Regex::new(r"(?i)\b(4k|uhd)\b").unwrap();
    static ref QUALITY: Regex = Regex::new(
        r"(?i)\b(remux|bluray|blu-ray|bdrip|brrip|web-?dl|webrip|web|hdtv|hdrip|dvdrip|dvd|hdcam|hd-?ts|telesync|cam|screener|scr)\b"
    ).unwrap();
    static ref ENCODE: Regex =
        Regex::new(r"(?i)\b(x26[45]|h\.?26[45]|hevc|avc|av1|xvid|divx|vp9)\b").unwrap();

    // ============ TAGS ============
    static ref VISUAL_TAGS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\bhdr10\+").unwrap(), "HDR10+"),
        (Regex::new(r"(?i)\bhdr10\b").unwrap(), "HDR10"),
        (Regex::new(r"(?i)\bhdr\b").unwrap(), "HDR"),
        (Regex::new(r"(?i)\b(dv|dovi|dolby\s*vision)\b").unwrap(), "DV"),
        (Regex::new(r"(?i)\b10.?bit\b").unwrap(), "10bit"),
        (Regex::new(r"(?i)\b3d\b").unwrap(), "3D"),
        (Regex::new(r"(?i)\bimax\b").unwrap(), "IMAX"),
        (Regex::new(r"(?i)\bsdr\b").unwrap(), "SDR"),
    ];
    static ref AUDIO_TAGS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\batmos\b").unwrap(), "Atmos"),
        (Regex::new(r"(?i)\btrue.?hd\b").unwrap(), "TrueHD"),
        (Regex::new(r"(?i)\bdts.?hd.?ma\b").unwrap(), "DTS-HD MA"),
        (Regex::new(r"(?i)\bdts.?hd\b").unwrap(), "DTS-HD"),
        (Regex::new(r"(?i)\bdts\b").unwrap(), "DTS"),
        (Regex::new(r"(?i)(\bddp\b|dd\+|\beac3\b|\be-ac-3\b)").unwrap(), "DD+"),
        (Regex::new(r"(?i)\b(dd|ac3)\b").unwrap(), "DD"),
        (Regex::new(r"(?i)\baac\b").unwrap(), "AAC"),
        (Regex::new(r"(?i)\bflac\b").unwrap(), "FLAC"),
        (Regex::new(r"(?i)\bopus\b").unwrap(), "OPUS"),
    ];
    static ref AUDIO_CHANNELS: Regex = Regex::new(r"\b([2578])\.([01])\b").unwrap();

    // ============ LANGUAGES ============
    static ref LANGUAGES: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"(?i)\b(multi|multilang)\b").unwrap(), "Multi"),
        (Regex::new(r"(?i)\bdual(\s*audio)?\b").unwrap(), "Dual Audio"),
        (Regex::new(r"(?i)\b(english|eng)\b").unwrap(), "English"),
        (Regex::new(r"(?i)\b(french|fre|vf|vff|vostfr)\b").unwrap(), "French"),
        (Regex::new(r"(?i)\b(german|ger)\b").unwrap(), "German"),
        (Regex::new(r"(?i)\b(spanish|spa|castellano|latino)\b").unwrap(), "Spanish"),
        (Regex::new(r"(?i)\b(italian|ita)\b").unwrap(), "Italian"),
        (Regex::new(r"(?i)\b(portuguese|dublado|legendado)\b").unwrap(), "Portuguese"),
        (Regex::new(r"(?i)\b(russian|rus)\b").unwrap(), "Russian"),
        (Regex::new(r"(?i)\b(japanese|jpn)\b").unwrap(), "Japanese"),
        (Regex::new(r"(?i)\b(korean|kor)\b").unwrap(), "Korean"),
        (Regex::new(r"(?i)\b(hindi|hin)\b").unwrap(), "Hindi"),
        (Regex::new(r"(?i)\b(chinese|chi|mandarin)\b").unwrap(), "Chinese"),
    ];

    // ============ TITLE EXTRACTORS ============
    static ref EXTRACTOR_YEAR: Regex = Regex::new(r"[\(\[\s.](19\d{2}|20\d{2})[\)\]\s.$]?").unwrap();
    static ref EXTRACTOR_SEASON_EPISODE: Regex =
        Regex::new(r"(?i)\bs(\d{1,2})[\s._-]?e(\d{1,4})\b").unwrap();
    static ref EXTRACTOR_ALT_SEASON_EPISODE: Regex = Regex::new(r"\b(\d{1,2})x(\d{1,4})\b").unwrap();
    static ref EXTRACTOR_SEASON: Regex =
        Regex::new(r"(?i)\b(?:s|season)[\s._-]?(\d{1,2})\b").unwrap();
    static ref EXTRACTOR_EPISODE: Regex =
        Regex::new(r"(?i)\b(?:e|ep|episode)[\s._-]?(\d{1,4})\b").unwrap();
    static ref EXTRACTOR_ABSOLUTE_EPISODE: Regex =
        Regex::new(r"(?i)[\s._-](\d{2,4})[\s._-](?:\[|\()").unwrap();
    static ref RELEASE_GROUP: Regex = Regex::new(r"-([A-Za-z0-9]+)(?:\.\w{2,4})?$").unwrap();

    // ============ SIZE / SEEDERS HELPERS ============
    static ref SIZE_TOKEN: Regex =
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(tb|gb|mb|kb|b)\b").unwrap();

    // ============ CLEANUP ============
    static ref NON_VIDEO_EXT: Regex =
        Regex::new(r"(?i)\.(srt|sub|idx|ssa|ass|vtt|nfo|txt|jpg|jpeg|png|gif|rar|zip|7z|exe|iso|par2|sfv)$").unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"[._]").unwrap();
    static ref BRACKETS: Regex = Regex::new(r"[\[\(][^\]\)]*[\]\)]").unwrap();
    static ref MULTI_SPACES: Regex = Regex::new(r"\s+").unwrap();
    static ref TRAILING_PUNCT: Regex = Regex::new(r"[.\-_\s]+$").unwrap();
}

/// Video container extensions, shared with the debrid file picker.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "mpg", "mpeg", "m4v", "ts", "m2ts",
];

/// Whether a filename looks like a playable video.
pub fn is_video_filename(name: &str) -> bool {
    let lower = name.to_lowercase();
    VIDEO_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{}", ext)))
}

/// Parse a human-readable size token ("4.2 GB") into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_TOKEN.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    let multiplier: f64 = match unit.as_str() {
        "tb" => 1024f64.powi(4),
        "gb" => 1024f64.powi(3),
        "mb" => 1024f64.powi(2),
        "kb" => 1024f64,
        _ => 1.0,
    };
    Some((value * multiplier) as u64)
}

/// Release-name parser.
///
/// Pure and idempotent; results are memoized per exact input string so
/// repeated parses of the same release name across one request are free.
pub struct TitleParser;

impl TitleParser {
    /// Parse a release name into structured attributes. Returns `None` for
    /// names that are recognisably not video content.
    pub fn parse(input: &str) -> Option<ParsedFile> {
        {
            let mut cache = PARSE_CACHE.lock().unwrap();
            if let Some(cached) = cache.get(input) {
                return cached.clone();
            }
        }

        let result = Self::parse_uncached(input);

        let mut cache = PARSE_CACHE.lock().unwrap();
        cache.put(input.to_string(), result.clone());
        result
    }

    fn parse_uncached(input: &str) -> Option<ParsedFile> {
        if input.trim().is_empty() || NON_VIDEO_EXT.is_match(input.trim()) {
            return None;
        }

        // Dots and underscores are word separators in release names.
        let text = SEPARATORS.replace_all(input, " ").to_string();

        let resolution = RESOLUTION
            .captures(&text)
            .map(|c| c[1].to_lowercase())
            .or_else(|| RESOLUTION_4K.is_match(&text).then(|| "2160p".to_string()));

        let quality = QUALITY.captures(&text).map(|c| normalize_quality(&c[1]));
        let encode = ENCODE.captures(&text).map(|c| normalize_encode(&c[1]));

        let visual_tags = suppress_families(
            VISUAL_TAGS
                .iter()
                .filter(|(re, _)| re.is_match(&text))
                .map(|(_, tag)| tag.to_string())
                .collect(),
            &[&["HDR10+", "HDR10", "HDR"]],
        );

        let audio_tags = suppress_families(
            AUDIO_TAGS
                .iter()
                .filter(|(re, _)| re.is_match(&text))
                .map(|(_, tag)| tag.to_string())
                .collect(),
            &[&["DTS-HD MA", "DTS-HD", "DTS"], &["DD+", "DD"]],
        );

        // Channel layouts keep their dot, so match against the raw input.
        let mut audio_channels: Vec<String> = Vec::new();
        for caps in AUDIO_CHANNELS.captures_iter(input) {
            let channel = format!("{}.{}", &caps[1], &caps[2]);
            if !audio_channels.contains(&channel) {
                audio_channels.push(channel);
            }
        }

        let languages: Vec<String> = LANGUAGES
            .iter()
            .filter(|(re, _)| re.is_match(&text))
            .map(|(_, lang)| lang.to_string())
            .collect();

        let year = EXTRACTOR_YEAR
            .captures(&text)
            .and_then(|c| c[1].parse::<u16>().ok());

        let (season, episode) = Self::extract_season_episode(&text);

        let release_group = RELEASE_GROUP
            .captures(input.trim())
            .map(|c| c[1].to_string())
            .filter(|g| {
                g.len() >= 2
                    && !g.chars().all(|ch| ch.is_ascii_digit())
                    && !matches!(g.to_uppercase().as_str(), "DL" | "WEB" | "HD" | "RIP")
            });

        let title = Self::extract_title(&text);

        Some(ParsedFile {
            resolution,
            quality,
            encode,
            visual_tags,
            audio_tags,
            audio_channels,
            languages,
            title,
            year,
            season,
            episode,
            release_group,
        })
    }

    fn extract_season_episode(text: &str) -> (Option<u32>, Option<u32>) {
        if let Some(caps) = EXTRACTOR_SEASON_EPISODE.captures(text) {
            return (
                caps.get(1).and_then(|m| m.as_str().parse().ok()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
            );
        }
        if let Some(caps) = EXTRACTOR_ALT_SEASON_EPISODE.captures(text) {
            return (
                caps.get(1).and_then(|m| m.as_str().parse().ok()),
                caps.get(2).and_then(|m| m.as_str().parse().ok()),
            );
        }
        let season = EXTRACTOR_SEASON
            .captures(text)
            .and_then(|c| c[1].parse().ok());
        let episode = EXTRACTOR_EPISODE
            .captures(text)
            .and_then(|c| c[1].parse().ok());
        (season, episode)
    }

    /// The title is whatever precedes the first structural token (year,
    /// SxxExx, resolution, quality).
    fn extract_title(text: &str) -> Option<String> {
        let mut cut = text.len();
        for position in [
            EXTRACTOR_SEASON_EPISODE.find(text).map(|m| m.start()),
            EXTRACTOR_YEAR.find(text).map(|m| m.start()),
            RESOLUTION.find(text).map(|m| m.start()),
            RESOLUTION_4K.find(text).map(|m| m.start()),
            QUALITY.find(text).map(|m| m.start()),
        ]
        .into_iter()
        .flatten()
        {
            cut = cut.min(position);
        }

        let head = &text[..cut];
        let cleaned = BRACKETS.replace_all(head, "");
        let cleaned = MULTI_SPACES.replace_all(&cleaned, " ");
        let cleaned = TRAILING_PUNCT.replace_all(cleaned.trim(), "");
        let title = cleaned.trim().to_string();
        (!title.is_empty()).then_some(title)
    }

    /// Drop the memo, for tests.
    #[cfg(test)]
    pub fn clear_cache() {
        PARSE_CACHE.lock().unwrap().clear();
    }
}

/// Keep only the most specific tag of each family, in listed order.
fn suppress_families(mut tags: Vec<String>, families: &[&[&str]]) -> Vec<String> {
    for family in families {
        if let Some(winner) = family.iter().find(|t| tags.iter().any(|x| x == *t)) {
            tags.retain(|t| t == *winner || !family.contains(&t.as_str()));
        }
    }
    tags
}

fn normalize_quality(raw: &str) -> String {
    let lower = raw.to_lowercase();
    match lower.as_str() {
        "blu-ray" | "bluray" => "BluRay".into(),
        "bdrip" => "BDRip".into(),
        "brrip" => "BRRip".into(),
        "remux" => "REMUX".into(),
        "webdl" | "web-dl" => "WEB-DL".into(),
        "webrip" => "WEBRip".into(),
        "web" => "WEB".into(),
        "hdtv" => "HDTV".into(),
        "hdrip" => "HDRip".into(),
        "dvdrip" => "DVDRip".into(),
        "dvd" => "DVD".into(),
        "hdcam" | "hdts" | "hd-ts" | "telesync" | "cam" => "CAM".into(),
        "screener" | "scr" => "SCR".into(),
        other => other.to_uppercase(),
    }
}

fn normalize_encode(raw: &str) -> String {
    let lower = raw.to_lowercase().replace('.', "");
    match lower.as_str() {
        "x265" | "h265" | "hevc" => "HEVC".into(),
        "x264" | "h264" | "avc" => "AVC".into(),
        "av1" => "AV1".into(),
        "xvid" => "XviD".into(),
        "divx" => "DivX".into(),
        "vp9" => "VP9".into(),
        other => other.to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_release_name() {
        let parsed =
            TitleParser::parse("The.Expanse.S03E05.2160p.WEB-DL.DV.HDR10.Atmos.5.1.x265-GROUP.mkv")
                .unwrap();
        assert_eq!(parsed.resolution.as_deref(), Some("2160p"));
        assert_eq!(parsed.quality.as_deref(), Some("WEB-DL"));
        assert_eq!(parsed.encode.as_deref(), Some("HEVC"));
        assert_eq!(parsed.season, Some(3));
        assert_eq!(parsed.episode, Some(5));
        assert!(parsed.visual_tags.contains(&"DV".to_string()));
        assert!(parsed.visual_tags.contains(&"HDR10".to_string()));
        assert!(parsed.audio_tags.contains(&"Atmos".to_string()));
        assert_eq!(parsed.audio_channels, vec!["5.1"]);
        assert_eq!(parsed.release_group.as_deref(), Some("GROUP"));
        assert_eq!(parsed.title.as_deref(), Some("The Expanse"));
    }

    #[test]
    fn test_parse_movie_with_year() {
        let parsed = TitleParser::parse("Dune Part Two (2024) 1080p BluRay x264").unwrap();
        assert_eq!(parsed.year, Some(2024));
        assert_eq!(parsed.resolution.as_deref(), Some("1080p"));
        assert_eq!(parsed.quality.as_deref(), Some("BluRay"));
        assert_eq!(parsed.title.as_deref(), Some("Dune Part Two"));
    }

    #[test]
    fn test_4k_normalizes_to_2160p() {
        let parsed = TitleParser::parse("Some Movie 4K HDR REMUX").unwrap();
        assert_eq!(parsed.resolution.as_deref(), Some("2160p"));
        assert_eq!(parsed.quality.as_deref(), Some("REMUX"));
    }

    #[test]
    fn test_non_video_returns_none() {
        assert!(TitleParser::parse("Some.Movie.2024.srt").is_none());
        assert!(TitleParser::parse("   ").is_none());
    }

    #[test]
    fn test_idempotent() {
        let first = TitleParser::parse("Show S01E02 720p WEBRip");
        let second = TitleParser::parse("Show S01E02 720p WEBRip");
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4 GB"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("💾 1.5 MB"), Some((1.5 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_size("no size here"), None);
    }

    #[test]
    fn test_is_video_filename() {
        assert!(is_video_filename("movie.MKV"));
        assert!(!is_video_filename("subs.srt"));
    }
}
