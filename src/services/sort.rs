//! Sorter
//!
//! Stable multi-criterion sort. Categorical criteria rank by position in
//! the user's preferred lists; numeric criteria compare directly; service
//! and addon rank by configured order. Per-request-type criterion lists
//! override the global list, and a leading `cached` criterion splits the
//! sort into cached/uncached partitions with their own criterion lists.

use std::cmp::Ordering;

use crate::models::{
    MediaType, ParsedStream, SortCriterion, SortDirection, SortKey, StreamType, UserConfig,
};

pub struct Sorter<'a> {
    config: &'a UserConfig,
}

impl<'a> Sorter<'a> {
    pub fn new(config: &'a UserConfig) -> Self {
        Self { config }
    }

    /// Sort a merged stream list. Streams with equal key tuples keep their
    /// merge order; error streams sink to the tail; `forceToTop` providers
    /// float to the head afterwards, in configured provider order.
    pub fn sort(&self, streams: Vec<ParsedStream>, media_type: MediaType) -> Vec<ParsedStream> {
        let criteria = self.criteria_for(media_type);

        let mut sorted = if let Some((cached_criterion, rest)) = leading_cached(&criteria) {
            self.sort_partitioned(streams, cached_criterion, rest)
        } else {
            let mut streams = streams;
            self.sort_with(&mut streams, &criteria);
            streams
        };

        // forceToTop providers move to the head after sorting; among them
        // the configured provider order decides.
        sorted.sort_by_key(|stream| {
            let forced = self
                .config
                .provider(&stream.addon.instance_id)
                .map(|p| p.force_to_top)
                .unwrap_or(false);
            if forced {
                (0usize, self.config.addon_rank(&stream.addon.instance_id))
            } else {
                (1, 0)
            }
        });

        // Error streams are informational; keep them at the tail.
        sorted.sort_by_key(|stream| matches!(stream.stream_type, StreamType::Error));
        sorted
    }

    fn criteria_for(&self, media_type: MediaType) -> Vec<SortCriterion> {
        let sort = &self.config.sort;
        let per_type = match media_type {
            MediaType::Movie => sort.movies.as_ref(),
            MediaType::Series => sort.series.as_ref(),
            MediaType::Anime => sort.anime.as_ref(),
            _ => None,
        };
        per_type.unwrap_or(&sort.global).clone()
    }

    fn sort_partitioned(
        &self,
        streams: Vec<ParsedStream>,
        cached_criterion: SortCriterion,
        rest: &[SortCriterion],
    ) -> Vec<ParsedStream> {
        let (mut cached, mut uncached): (Vec<_>, Vec<_>) =
            streams.into_iter().partition(|s| s.is_cached());

        let cached_criteria = self.config.sort.cached.clone().unwrap_or_else(|| rest.to_vec());
        let uncached_criteria = self
            .config
            .sort
            .uncached
            .clone()
            .unwrap_or_else(|| rest.to_vec());

        self.sort_with(&mut cached, &cached_criteria);
        self.sort_with(&mut uncached, &uncached_criteria);

        match cached_criterion.direction {
            SortDirection::Desc => {
                cached.extend(uncached);
                cached
            }
            SortDirection::Asc => {
                uncached.extend(cached);
                uncached
            }
        }
    }

    fn sort_with(&self, streams: &mut [ParsedStream], criteria: &[SortCriterion]) {
        streams.sort_by(|a, b| {
            for criterion in criteria {
                let score_a = self.score(a, criterion.key);
                let score_b = self.score(b, criterion.key);
                let ordering = match criterion.direction {
                    // larger score = more preferred; desc puts it first
                    SortDirection::Desc => score_b.partial_cmp(&score_a),
                    SortDirection::Asc => score_a.partial_cmp(&score_b),
                }
                .unwrap_or(Ordering::Equal);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    /// Score one stream under one criterion; larger is more preferred.
    fn score(&self, stream: &ParsedStream, key: SortKey) -> f64 {
        let filters = &self.config.filters;
        match key {
            SortKey::Resolution => {
                preferred_score(&filters.resolution.preferred, stream.parsed_file.resolution.as_deref())
            }
            SortKey::Quality => {
                preferred_score(&filters.quality.preferred, stream.parsed_file.quality.as_deref())
            }
            SortKey::Encode => {
                preferred_score(&filters.encode.preferred, stream.parsed_file.encode.as_deref())
            }
            SortKey::Language => {
                preferred_list_score(&filters.language.preferred, &stream.parsed_file.languages)
            }
            SortKey::VisualTag => {
                preferred_list_score(&filters.visual_tag.preferred, &stream.parsed_file.visual_tags)
            }
            SortKey::AudioTag => {
                preferred_list_score(&filters.audio_tag.preferred, &stream.parsed_file.audio_tags)
            }
            SortKey::AudioChannel => preferred_list_score(
                &filters.audio_channel.preferred,
                &stream.parsed_file.audio_channels,
            ),
            SortKey::StreamType => preferred_score(
                &filters.stream_type.preferred,
                Some(&stream.stream_type.to_string()),
            ),
            SortKey::Size => stream.size.unwrap_or(0) as f64,
            SortKey::Seeders => stream
                .torrent
                .as_ref()
                .and_then(|t| t.seeders)
                .map(|s| s as f64)
                .unwrap_or(-1.0),
            SortKey::Service => match &stream.service {
                Some(service) => rank_score(self.config.service_rank(service.id)),
                None => f64::MIN,
            },
            SortKey::Addon => rank_score(self.config.addon_rank(&stream.addon.instance_id)),
            SortKey::RegexPatterns => match stream.regex_matched {
                Some(index) => rank_score(index),
                None => f64::MIN,
            },
            SortKey::StreamExpressionMatched => match stream.stream_expression_matched {
                Some(index) => rank_score(index),
                None => f64::MIN,
            },
            SortKey::Cached => {
                if stream.is_cached() {
                    1.0
                } else {
                    0.0
                }
            }
            SortKey::Library => {
                if stream.library {
                    1.0
                } else {
                    0.0
                }
            }
            SortKey::Keyword => {
                if stream.keyword_matched.unwrap_or(false) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Earlier list position scores higher; an unlisted value scores lowest.
fn preferred_score(preferred: &[String], value: Option<&str>) -> f64 {
    match value {
        Some(value) => preferred
            .iter()
            .position(|p| p.eq_ignore_ascii_case(value))
            .map(rank_score)
            .unwrap_or(f64::MIN),
        None => f64::MIN,
    }
}

/// Best preferred position among a list-valued attribute.
fn preferred_list_score(preferred: &[String], values: &[String]) -> f64 {
    values
        .iter()
        .filter_map(|v| {
            preferred
                .iter()
                .position(|p| p.eq_ignore_ascii_case(v))
        })
        .min()
        .map(rank_score)
        .unwrap_or(f64::MIN)
}

fn rank_score(rank: usize) -> f64 {
    -(rank as f64)
}

/// When `cached` leads the criterion list, the sort partitions.
fn leading_cached(criteria: &[SortCriterion]) -> Option<(SortCriterion, &[SortCriterion])> {
    match criteria.first() {
        Some(first) if first.key == SortKey::Cached => Some((*first, &criteria[1..])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AddonRef, ProviderDescriptor, Resource, ServiceRef, SortConfig, UserConfig,
    };
    use crate::models::ServiceId;
    use std::collections::HashMap;

    fn provider(id: &str, force_to_top: bool) -> ProviderDescriptor {
        ProviderDescriptor {
            instance_id: id.into(),
            manifest_url: format!("https://{}/manifest.json", id),
            display_name: id.to_uppercase(),
            identifier: id.into(),
            short_id: id.into(),
            timeout_ms: 5000,
            resources: vec![Resource::Stream],
            media_types: vec![],
            extra_headers: HashMap::new(),
            force_to_top,
            library: false,
            format_passthrough: false,
            result_passthrough: false,
        }
    }

    fn desc(key: SortKey) -> SortCriterion {
        SortCriterion {
            key,
            direction: SortDirection::Desc,
        }
    }

    fn stream(id: &str, addon: &str, resolution: &str, size: u64) -> ParsedStream {
        let mut s = ParsedStream::error(
            AddonRef {
                instance_id: addon.into(),
                name: addon.to_uppercase(),
            },
            "x",
            None,
        );
        s.id = id.into();
        s.error = None;
        s.stream_type = StreamType::Http;
        s.url = Some("http://example.com/v.mkv".into());
        s.parsed_file.resolution = Some(resolution.into());
        s.size = Some(size);
        s
    }

    fn config(sort: SortConfig, providers: Vec<ProviderDescriptor>) -> UserConfig {
        let mut config = UserConfig {
            user_id: "u".into(),
            providers,
            services: vec![],
            groups: vec![],
            group_behaviour: crate::models::GroupBehaviour::Parallel,
            dynamic_fetch_condition: None,
            filters: Default::default(),
            dedup: Default::default(),
            sort,
            proxy: Default::default(),
            format: Default::default(),
            hide_errors: false,
            hide_errors_for_resources: vec![],
            cache_and_play: vec![],
            trusted_regex: false,
        };
        config.filters.resolution.preferred = vec!["2160p".into(), "1080p".into(), "720p".into()];
        config
    }

    #[test]
    fn test_preferred_resolution_order() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Resolution)],
                ..Default::default()
            },
            vec![provider("p1", false)],
        );
        let streams = vec![
            stream("s1", "p1", "720p", 0),
            stream("s2", "p1", "2160p", 0),
            stream("s3", "p1", "1080p", 0),
        ];
        let out = Sorter::new(&config).sort(streams, MediaType::Movie);
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s3", "s1"]);
    }

    #[test]
    fn test_stable_on_equal_keys() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Resolution)],
                ..Default::default()
            },
            vec![provider("p1", false)],
        );
        let streams = vec![
            stream("s1", "p1", "1080p", 10),
            stream("s2", "p1", "1080p", 20),
            stream("s3", "p1", "1080p", 30),
        ];
        let out = Sorter::new(&config).sort(streams, MediaType::Movie);
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_secondary_size_criterion() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Resolution), desc(SortKey::Size)],
                ..Default::default()
            },
            vec![provider("p1", false)],
        );
        let streams = vec![
            stream("s1", "p1", "1080p", 10),
            stream("s2", "p1", "1080p", 30),
            stream("s3", "p1", "2160p", 5),
        ];
        let out = Sorter::new(&config).sort(streams, MediaType::Movie);
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s2", "s1"]);
    }

    #[test]
    fn test_cached_partition() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Cached), desc(SortKey::Size)],
                ..Default::default()
            },
            vec![provider("p1", false)],
        );
        let mut cached_small = stream("s1", "p1", "1080p", 10);
        cached_small.service = Some(ServiceRef {
            id: ServiceId::RealDebrid,
            cached: true,
        });
        let mut cached_big = stream("s2", "p1", "1080p", 99);
        cached_big.service = Some(ServiceRef {
            id: ServiceId::RealDebrid,
            cached: true,
        });
        let uncached = stream("s3", "p1", "1080p", 1000);

        let out = Sorter::new(&config).sort(
            vec![uncached, cached_small, cached_big],
            MediaType::Movie,
        );
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        // cached partition first, each partition sorted by size
        assert_eq!(ids, vec!["s2", "s1", "s3"]);
    }

    #[test]
    fn test_per_type_override() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Resolution)],
                series: Some(vec![desc(SortKey::Size)]),
                ..Default::default()
            },
            vec![provider("p1", false)],
        );
        let streams = vec![
            stream("s1", "p1", "2160p", 10),
            stream("s2", "p1", "720p", 99),
        ];
        let out = Sorter::new(&config).sort(streams, MediaType::Series);
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
    }

    #[test]
    fn test_force_to_top_uses_provider_order() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Size)],
                ..Default::default()
            },
            vec![provider("p1", true), provider("p2", true), provider("p3", false)],
        );
        let streams = vec![
            stream("s1", "p3", "1080p", 1000),
            stream("s2", "p2", "1080p", 10),
            stream("s3", "p1", "1080p", 1),
        ];
        let out = Sorter::new(&config).sort(streams, MediaType::Movie);
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        // both forced providers lead, p1 before p2 by configured order
        assert_eq!(ids, vec!["s3", "s2", "s1"]);
    }

    #[test]
    fn test_error_streams_sink() {
        let config = config(
            SortConfig {
                global: vec![desc(SortKey::Size)],
                ..Default::default()
            },
            vec![provider("p1", false)],
        );
        let error = ParsedStream::error(
            AddonRef {
                instance_id: "p1".into(),
                name: "P1".into(),
            },
            "timed out",
            None,
        );
        let streams = vec![error, stream("s1", "p1", "1080p", 5)];
        let out = Sorter::new(&config).sort(streams, MediaType::Movie);
        assert_eq!(out[0].id, "s1");
        assert_eq!(out[1].stream_type, StreamType::Error);
    }
}
