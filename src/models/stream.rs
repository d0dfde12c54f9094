//! Stream records: the upstream wire shape and the canonical internal shape
//! every pipeline stage operates on.

use serde::{Deserialize, Serialize};

use crate::models::provider::ServiceId;

/// Classification of a parsed stream, derived from the fields present on the
/// wire record and the addon's advertised stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    P2p,
    Live,
    Usenet,
    Debrid,
    Http,
    External,
    Youtube,
    Error,
    Statistic,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamType::P2p => "p2p",
            StreamType::Live => "live",
            StreamType::Usenet => "usenet",
            StreamType::Debrid => "debrid",
            StreamType::Http => "http",
            StreamType::External => "external",
            StreamType::Youtube => "youtube",
            StreamType::Error => "error",
            StreamType::Statistic => "statistic",
        };
        write!(f, "{}", s)
    }
}

/// Subtitle track attached to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtitle {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

/// Player hints carried on the upstream wire record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binge_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_headers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_web_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_whitelist: Option<Vec<String>>,
}

/// Upstream wire record as returned by an addon's stream resource.
///
/// At least one of `url`, `external_url`, `yt_id` or `info_hash` must be
/// present for the record to be playable; `is_playable` checks that.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStream {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description line. Some addons still ship this under the legacy
    /// `title` key, so both are accepted.
    #[serde(skip_serializing_if = "Option::is_none", alias = "title")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_idx: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitles: Vec<Subtitle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior_hints: Option<BehaviorHints>,
}

impl RawStream {
    /// A record with no playable reference is rejected with a per-addon
    /// error rather than silently dropped.
    pub fn is_playable(&self) -> bool {
        self.url.is_some()
            || self.external_url.is_some()
            || self.yt_id.is_some()
            || self.info_hash.is_some()
    }
}

/// Attributes extracted from a release name by the title parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visual_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_group: Option<String>,
}

/// Torrent-specific attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentInfo {
    pub info_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_idx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeders: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

/// Debrid-service attribution for a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub id: ServiceId,
    pub cached: bool,
}

/// Reference back to the provider a stream came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonRef {
    pub instance_id: String,
    pub name: String,
}

/// Inline error surfaced instead of a playable stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamError {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Canonical internal stream record produced by the parser/enricher and
/// consumed by every later pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedStream {
    pub id: String,
    pub addon: AddonRef,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    #[serde(default)]
    pub parsed_file: ParsedFile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torrent: Option<TorrentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexer: Option<String>,
    /// Age of the release as reported by the indexer, e.g. "3d".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtitles: Vec<Subtitle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_whitelist: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_web_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binge_group: Option<String>,
    #[serde(default)]
    pub proxied: bool,
    /// Index of the preferred-regex rule this stream matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_matched: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_matched: Option<bool>,
    /// Index of the preferred stream-expression this stream matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_expression_matched: Option<usize>,
    #[serde(default)]
    pub library: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
}

impl ParsedStream {
    /// Build an inline error stream attributed to a provider.
    pub fn error(addon: AddonRef, title: impl Into<String>, description: Option<String>) -> Self {
        Self {
            id: format!("error-{}", addon.instance_id),
            addon,
            stream_type: StreamType::Error,
            parsed_file: ParsedFile::default(),
            size: None,
            folder_size: None,
            torrent: None,
            service: None,
            indexer: None,
            age: None,
            filename: None,
            folder_name: None,
            url: None,
            external_url: None,
            yt_id: None,
            subtitles: Vec::new(),
            country_whitelist: None,
            not_web_ready: None,
            binge_group: None,
            proxied: false,
            regex_matched: None,
            keyword_matched: None,
            stream_expression_matched: None,
            library: false,
            duration: None,
            error: Some(StreamError {
                title: title.into(),
                description,
            }),
        }
    }

    /// Whether the stream is cached on its attributed debrid service.
    pub fn is_cached(&self) -> bool {
        self.service.as_ref().map(|s| s.cached).unwrap_or(false)
    }

    /// Per-type minimum-fields rule. A record violating it is a bug in the
    /// enricher, not in the upstream.
    pub fn validate(&self) -> Result<(), String> {
        match self.stream_type {
            StreamType::Debrid | StreamType::Http | StreamType::Live => {
                if self.url.is_none() {
                    return Err(format!("{} stream requires a url", self.stream_type));
                }
            }
            StreamType::P2p => {
                if self.torrent.as_ref().map(|t| t.info_hash.is_empty()).unwrap_or(true) {
                    return Err("p2p stream requires torrent.infoHash".into());
                }
            }
            StreamType::Usenet => {
                if self.url.is_none() {
                    return Err("usenet stream requires a url".into());
                }
            }
            StreamType::External => {
                if self.external_url.is_none() && self.url.is_none() {
                    return Err("external stream requires externalUrl".into());
                }
            }
            StreamType::Youtube => {
                if self.yt_id.is_none() {
                    return Err("youtube stream requires ytId".into());
                }
            }
            StreamType::Error => {
                if self.error.as_ref().map(|e| e.title.is_empty()).unwrap_or(true) {
                    return Err("error stream requires error.title".into());
                }
            }
            StreamType::Statistic => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addon() -> AddonRef {
        AddonRef {
            instance_id: "a1".into(),
            name: "Test Addon".into(),
        }
    }

    #[test]
    fn test_raw_stream_playable() {
        let mut raw = RawStream::default();
        assert!(!raw.is_playable());
        raw.info_hash = Some("abc".into());
        assert!(raw.is_playable());
    }

    #[test]
    fn test_raw_stream_accepts_legacy_title_key() {
        let raw: RawStream =
            serde_json::from_str(r#"{"name":"X","title":"Some description"}"#).unwrap();
        assert_eq!(raw.description.as_deref(), Some("Some description"));
    }

    #[test]
    fn test_error_stream_validates() {
        let stream = ParsedStream::error(addon(), "Timed out", None);
        assert!(stream.validate().is_ok());
        assert_eq!(stream.stream_type, StreamType::Error);
    }

    #[test]
    fn test_p2p_requires_info_hash() {
        let mut stream = ParsedStream::error(addon(), "x", None);
        stream.stream_type = StreamType::P2p;
        stream.error = None;
        assert!(stream.validate().is_err());
        stream.torrent = Some(TorrentInfo {
            info_hash: "deadbeef".into(),
            ..Default::default()
        });
        assert!(stream.validate().is_ok());
    }
}
