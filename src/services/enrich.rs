//! Parser & enricher
//!
//! Turns upstream wire records into canonical parsed streams: applies the
//! title parser over name, description and filename, derives the stream
//! type, attaches the provider reference and detects which debrid service
//! a stream already targets. Failures become inline error streams, never
//! silent drops.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{
    AddonRef, ParsedFile, ParsedStream, ProviderDescriptor, RawStream, ServiceId, ServiceRef,
    StreamType, TorrentInfo,
};
use crate::services::parser::{parse_size, TitleParser};

lazy_static! {
    static ref SEEDERS_TOKEN: Regex =
        Regex::new(r"(?i)(?:👤|👥|seed(?:er)?s?[:\s])\s*(\d+)").unwrap();
    static ref AGE_TOKEN: Regex =
        Regex::new(r"(?i)(?:🕒|📅|age[:\s])\s*(\d+\s?[smhdwy])").unwrap();
    static ref INDEXER_TOKEN: Regex =
        Regex::new(r"(?i)(?:🔍|⚙️|indexer[:\s])\s*([A-Za-z0-9.\-]+)").unwrap();
    static ref USENET_TOKEN: Regex = Regex::new(r"(?i)\b(nzb|usenet)\b").unwrap();
    static ref CACHED_MARK: Regex = Regex::new(r"⚡|\binstant\b|\bcached\b").unwrap();
    static ref UNCACHED_MARK: Regex = Regex::new(r"⏳|\bdownload\b|\buncached\b").unwrap();
    static ref FILENAME_LINE: Regex =
        Regex::new(r"(?m)^\S+\.(mkv|mp4|avi|mov|wmv|webm|m4v|ts)$").unwrap();
}

pub struct Enricher;

impl Enricher {
    /// Enrich a provider's raw streams. Order is preserved; records that
    /// cannot be enriched become inline error streams in place.
    pub fn enrich_all(provider: &ProviderDescriptor, raws: Vec<RawStream>) -> Vec<ParsedStream> {
        raws.into_iter()
            .enumerate()
            .map(|(index, raw)| {
                Self::enrich_one(provider, index, &raw).unwrap_or_else(|reason| {
                    ParsedStream::error(
                        addon_ref(provider),
                        format!("[{}] bad stream", provider.display_name),
                        Some(reason),
                    )
                })
            })
            .collect()
    }

    fn enrich_one(
        provider: &ProviderDescriptor,
        index: usize,
        raw: &RawStream,
    ) -> Result<ParsedStream, String> {
        if !raw.is_playable() {
            return Err("stream has no url, externalUrl, ytId or infoHash".into());
        }

        let hints = raw.behavior_hints.clone().unwrap_or_default();
        let name = raw.name.clone().unwrap_or_default();
        let description = raw.description.clone().unwrap_or_default();

        let filename = hints.filename.clone().or_else(|| {
            FILENAME_LINE
                .find(&description)
                .map(|m| m.as_str().to_string())
        });

        // Fixed parse order: name, then description, then filename. The
        // first input that parses wins, later ones fill gaps.
        let mut parsed_file = ParsedFile::default();
        for input in [Some(name.as_str()), Some(description.as_str()), filename.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(parsed) = TitleParser::parse(input) {
                parsed_file = merge_parsed(parsed_file, parsed);
            }
        }

        let service = Self::detect_service(raw, &name, &description);
        let stream_type = Self::derive_type(raw, service.as_ref(), &name, &description);

        let size = hints
            .video_size
            .or_else(|| parse_size(&description))
            .or_else(|| parse_size(&name));

        let torrent = raw.info_hash.as_ref().map(|hash| TorrentInfo {
            info_hash: hash.to_lowercase(),
            file_idx: raw.file_idx,
            seeders: SEEDERS_TOKEN
                .captures(&description)
                .and_then(|c| c[1].parse().ok()),
            sources: raw.sources.clone(),
        });

        let stream = ParsedStream {
            id: format!("{}.{}", provider.instance_id, index),
            addon: addon_ref(provider),
            stream_type,
            parsed_file,
            size,
            folder_size: None,
            torrent,
            service,
            indexer: INDEXER_TOKEN
                .captures(&description)
                .map(|c| c[1].to_string()),
            age: AGE_TOKEN.captures(&description).map(|c| c[1].to_string()),
            filename,
            folder_name: None,
            url: raw.url.clone(),
            external_url: raw.external_url.clone(),
            yt_id: raw.yt_id.clone(),
            subtitles: raw.subtitles.clone(),
            country_whitelist: hints.country_whitelist.clone(),
            not_web_ready: hints.not_web_ready,
            binge_group: hints.binge_group.clone(),
            proxied: false,
            regex_matched: None,
            keyword_matched: None,
            stream_expression_matched: None,
            library: provider.library,
            duration: None,
            error: None,
        };

        stream.validate()?;
        Ok(stream)
    }

    /// Rule table over the presence of infoHash / ytId / externalUrl / url
    /// plus the detected service attribution.
    fn derive_type(
        raw: &RawStream,
        service: Option<&ServiceRef>,
        name: &str,
        description: &str,
    ) -> StreamType {
        if raw.yt_id.is_some() {
            return StreamType::Youtube;
        }
        if raw.info_hash.is_some() && raw.url.is_none() {
            return StreamType::P2p;
        }
        if raw.external_url.is_some() && raw.url.is_none() {
            return StreamType::External;
        }
        let text = format!("{} {}", name, description);
        if USENET_TOKEN.is_match(&text) {
            return StreamType::Usenet;
        }
        if service.is_some() {
            return StreamType::Debrid;
        }
        StreamType::Http
    }

    /// Detect the debrid service a stream already targets from its URL
    /// host, falling back to name tokens like `[RD+]`.
    fn detect_service(raw: &RawStream, name: &str, description: &str) -> Option<ServiceRef> {
        let host = raw
            .url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()));

        if let Some(host) = &host {
            for service in ServiceId::ALL {
                if service.host_tokens().iter().any(|t| host.contains(t)) {
                    let cached = Self::detect_cached(name, description).unwrap_or(true);
                    return Some(ServiceRef { id: service, cached });
                }
            }
        }

        for service in ServiceId::ALL {
            for token in service.name_tokens() {
                let bracketed_cached = format!("[{}+]", token);
                let bracketed = format!("[{}", token);
                if name.contains(&bracketed_cached) {
                    return Some(ServiceRef {
                        id: service,
                        cached: true,
                    });
                }
                if name.contains(&bracketed) {
                    let cached = Self::detect_cached(name, description).unwrap_or(false);
                    return Some(ServiceRef { id: service, cached });
                }
            }
        }
        None
    }

    fn detect_cached(name: &str, description: &str) -> Option<bool> {
        let text = format!("{} {}", name, description);
        if CACHED_MARK.is_match(&text) {
            return Some(true);
        }
        if UNCACHED_MARK.is_match(&text) {
            return Some(false);
        }
        None
    }
}

fn addon_ref(provider: &ProviderDescriptor) -> AddonRef {
    AddonRef {
        instance_id: provider.instance_id.clone(),
        name: provider.display_name.clone(),
    }
}

/// Later parses fill fields the earlier ones left empty.
fn merge_parsed(mut base: ParsedFile, other: ParsedFile) -> ParsedFile {
    base.resolution = base.resolution.or(other.resolution);
    base.quality = base.quality.or(other.quality);
    base.encode = base.encode.or(other.encode);
    base.title = base.title.or(other.title);
    base.year = base.year.or(other.year);
    base.season = base.season.or(other.season);
    base.episode = base.episode.or(other.episode);
    base.release_group = base.release_group.or(other.release_group);
    for tag in other.visual_tags {
        if !base.visual_tags.contains(&tag) {
            base.visual_tags.push(tag);
        }
    }
    for tag in other.audio_tags {
        if !base.audio_tags.contains(&tag) {
            base.audio_tags.push(tag);
        }
    }
    for channel in other.audio_channels {
        if !base.audio_channels.contains(&channel) {
            base.audio_channels.push(channel);
        }
    }
    for language in other.languages {
        if !base.languages.contains(&language) {
            base.languages.push(language);
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider() -> ProviderDescriptor {
        ProviderDescriptor {
            instance_id: "tor1".into(),
            manifest_url: "https://addon.example.com/manifest.json".into(),
            display_name: "Torrent Addon".into(),
            identifier: "torrent-addon".into(),
            short_id: "ta".into(),
            timeout_ms: 5000,
            resources: vec![],
            media_types: vec![],
            extra_headers: HashMap::new(),
            force_to_top: false,
            library: false,
            format_passthrough: false,
            result_passthrough: false,
        }
    }

    #[test]
    fn test_p2p_stream_enriched() {
        let raw = RawStream {
            name: Some("Addon 1080p".into()),
            description: Some(
                "Breaking.Bad.S01E01.1080p.BluRay.x264-GROUP\n👤 87 💾 2.1 GB ⚙️ rarbg".into(),
            ),
            info_hash: Some("DEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF".into()),
            file_idx: Some(0),
            ..Default::default()
        };
        let streams = Enricher::enrich_all(&provider(), vec![raw]);
        assert_eq!(streams.len(), 1);
        let s = &streams[0];
        assert_eq!(s.stream_type, StreamType::P2p);
        assert_eq!(s.id, "tor1.0");
        let torrent = s.torrent.as_ref().unwrap();
        assert_eq!(torrent.info_hash, "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef");
        assert_eq!(torrent.seeders, Some(87));
        assert_eq!(s.size, Some((2.1 * 1024.0 * 1024.0 * 1024.0) as u64));
        assert_eq!(s.indexer.as_deref(), Some("rarbg"));
        assert_eq!(s.parsed_file.resolution.as_deref(), Some("1080p"));
        assert_eq!(s.parsed_file.season, Some(1));
    }

    #[test]
    fn test_debrid_detected_from_host() {
        let raw = RawStream {
            name: Some("Addon ⚡".into()),
            description: Some("Movie.2024.2160p.WEB-DL.mkv".into()),
            url: Some("https://my.real-debrid.com/d/ABCDEF/Movie.mkv".into()),
            ..Default::default()
        };
        let streams = Enricher::enrich_all(&provider(), vec![raw]);
        let s = &streams[0];
        assert_eq!(s.stream_type, StreamType::Debrid);
        let service = s.service.as_ref().unwrap();
        assert_eq!(service.id, ServiceId::RealDebrid);
        assert!(service.cached);
    }

    #[test]
    fn test_debrid_detected_from_name_token() {
        let raw = RawStream {
            name: Some("[TB download] Addon".into()),
            description: Some("Movie.2024.1080p.mkv".into()),
            url: Some("https://example.com/playback/xyz".into()),
            ..Default::default()
        };
        let streams = Enricher::enrich_all(&provider(), vec![raw]);
        let service = streams[0].service.as_ref().unwrap();
        assert_eq!(service.id, ServiceId::Torbox);
        assert!(!service.cached);
    }

    #[test]
    fn test_unplayable_becomes_error_stream() {
        let raw = RawStream {
            name: Some("broken".into()),
            ..Default::default()
        };
        let streams = Enricher::enrich_all(&provider(), vec![raw]);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].stream_type, StreamType::Error);
        assert!(streams[0].error.is_some());
    }

    #[test]
    fn test_youtube_and_external_types() {
        let yt = RawStream {
            yt_id: Some("dQw4w9WgXcQ".into()),
            ..Default::default()
        };
        let ext = RawStream {
            external_url: Some("https://example.com/watch".into()),
            ..Default::default()
        };
        let streams = Enricher::enrich_all(&provider(), vec![yt, ext]);
        assert_eq!(streams[0].stream_type, StreamType::Youtube);
        assert_eq!(streams[1].stream_type, StreamType::External);
    }
}
