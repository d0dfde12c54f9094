//! Filterer
//!
//! Applies the excluded/included/required list semantics across every
//! categorical attribute, plus regex, keyword, stream-expression, seeder
//! and size rules. The filter is the AND of all category predicates, so
//! evaluation order does not matter. Preferred lists never eliminate;
//! they only annotate streams for the sorter.

use regex::Regex;

use crate::models::{
    CatalogFilter, MediaType, ParsedStream, SeedersScope, SizeRange, StreamType, UserConfig,
};
use crate::services::expression::{self, ExprError};

/// Filter construction/evaluation failure.
#[derive(Debug)]
pub enum FilterError {
    InvalidRegex { pattern: String, message: String },
    RegexNotAllowed { pattern: String },
    Expression(ExprError),
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::InvalidRegex { pattern, message } => {
                write!(f, "invalid regex '{}': {}", pattern, message)
            }
            FilterError::RegexNotAllowed { pattern } => {
                write!(f, "regex '{}' is not on the allow-list", pattern)
            }
            FilterError::Expression(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FilterError {}

impl From<ExprError> for FilterError {
    fn from(e: ExprError) -> Self {
        FilterError::Expression(e)
    }
}

/// Value used when an attribute is absent, so lists can target it.
const UNKNOWN: &str = "unknown";

fn compile_patterns(
    patterns: &[String],
    trusted: bool,
    allow_list: &[String],
) -> Result<Vec<Regex>, FilterError> {
    patterns
        .iter()
        .map(|pattern| {
            if !trusted && !allow_list.iter().any(|allowed| allowed == pattern) {
                return Err(FilterError::RegexNotAllowed {
                    pattern: pattern.clone(),
                });
            }
            Regex::new(pattern).map_err(|e| FilterError::InvalidRegex {
                pattern: pattern.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Case-insensitive intersection test.
fn intersects(values: &[String], list: &[String]) -> bool {
    values
        .iter()
        .any(|v| list.iter().any(|l| l.eq_ignore_ascii_case(v)))
}

/// The excluded/included/required predicate for one attribute.
fn list_predicate(values: &[String], filter: &CatalogFilter) -> bool {
    if intersects(values, &filter.excluded) {
        return false;
    }
    if !filter.included.is_empty() && !intersects(values, &filter.included) {
        return false;
    }
    filter
        .required
        .iter()
        .all(|token| values.iter().any(|v| v.eq_ignore_ascii_case(token)))
}

fn single(value: Option<&str>) -> Vec<String> {
    vec![value.unwrap_or(UNKNOWN).to_string()]
}

fn listed(values: &[String]) -> Vec<String> {
    if values.is_empty() {
        vec![UNKNOWN.to_string()]
    } else {
        values.to_vec()
    }
}

/// Visual tags plus the synthetic HDR/DV combinations.
fn visual_tag_values(stream: &ParsedStream) -> Vec<String> {
    let tags = &stream.parsed_file.visual_tags;
    let has_dv = tags.iter().any(|t| t == "DV");
    let has_hdr = tags.iter().any(|t| t.starts_with("HDR"));
    let mut values = listed(tags);
    if has_dv && has_hdr {
        values.push("HDR+DV".to_string());
    } else if has_dv {
        values.push("DV Only".to_string());
    } else if has_hdr {
        values.push("HDR Only".to_string());
    }
    values
}

pub struct Filterer {
    resolution: CatalogFilter,
    quality: CatalogFilter,
    language: CatalogFilter,
    visual_tag: CatalogFilter,
    audio_tag: CatalogFilter,
    audio_channel: CatalogFilter,
    stream_type: CatalogFilter,
    encode: CatalogFilter,
    keyword: CatalogFilter,
    seeders: Vec<crate::models::SeedersFilter>,
    size: crate::models::SizeFilter,
    excluded_regex: Vec<Regex>,
    included_regex: Vec<Regex>,
    required_regex: Vec<Regex>,
    preferred_regex: Vec<Regex>,
    excluded_expressions: Vec<String>,
    required_expressions: Vec<String>,
    preferred_expressions: Vec<String>,
}

impl Filterer {
    /// Compile a user's filter configuration. Untrusted users' regex
    /// patterns must appear verbatim on the operator allow-list.
    pub fn new(config: &UserConfig, allow_list: &[String]) -> Result<Self, FilterError> {
        let filters = &config.filters;
        let trusted = config.trusted_regex;

        for source in filters
            .stream_expression
            .excluded
            .iter()
            .chain(&filters.stream_expression.required)
            .chain(&filters.stream_expression.preferred)
        {
            expression::validate_selector(source)?;
        }

        Ok(Self {
            resolution: filters.resolution.clone(),
            quality: filters.quality.clone(),
            language: filters.language.clone(),
            visual_tag: filters.visual_tag.clone(),
            audio_tag: filters.audio_tag.clone(),
            audio_channel: filters.audio_channel.clone(),
            stream_type: filters.stream_type.clone(),
            encode: filters.encode.clone(),
            keyword: filters.keyword.clone(),
            seeders: filters.seeders.clone(),
            size: filters.size.clone(),
            excluded_regex: compile_patterns(&filters.regex.excluded, trusted, allow_list)?,
            included_regex: compile_patterns(&filters.regex.included, trusted, allow_list)?,
            required_regex: compile_patterns(&filters.regex.required, trusted, allow_list)?,
            preferred_regex: compile_patterns(&filters.regex.preferred, trusted, allow_list)?,
            excluded_expressions: filters.stream_expression.excluded.clone(),
            required_expressions: filters.stream_expression.required.clone(),
            preferred_expressions: filters.stream_expression.preferred.clone(),
        })
    }

    /// Apply every predicate. Error and statistic streams pass through
    /// untouched. Surviving streams keep their input order and carry the
    /// preferred-rule annotations for the sorter.
    pub fn apply(
        &self,
        streams: Vec<ParsedStream>,
        media_type: MediaType,
    ) -> Result<Vec<ParsedStream>, FilterError> {
        // Expression selectors operate on the whole candidate collection.
        let mut excluded_by_expression = vec![false; streams.len()];
        for source in &self.excluded_expressions {
            for index in expression::select(source, &streams)? {
                excluded_by_expression[index] = true;
            }
        }
        let mut required_by_expression = vec![self.required_expressions.is_empty(); streams.len()];
        for source in &self.required_expressions {
            for index in expression::select(source, &streams)? {
                required_by_expression[index] = true;
            }
        }
        let mut expression_matched: Vec<Option<usize>> = vec![None; streams.len()];
        for (rule_index, source) in self.preferred_expressions.iter().enumerate() {
            for index in expression::select(source, &streams)? {
                expression_matched[index].get_or_insert(rule_index);
            }
        }

        let mut survivors = Vec::with_capacity(streams.len());
        for (index, mut stream) in streams.into_iter().enumerate() {
            if matches!(
                stream.stream_type,
                StreamType::Error | StreamType::Statistic
            ) {
                survivors.push(stream);
                continue;
            }

            if excluded_by_expression[index] || !required_by_expression[index] {
                continue;
            }
            if !self.passes_categories(&stream) {
                continue;
            }
            if !self.passes_regex(&stream) {
                continue;
            }
            if !self.passes_keywords(&stream) {
                continue;
            }
            if !self.passes_seeders(&stream) {
                continue;
            }
            if !self.passes_size(&stream, media_type) {
                continue;
            }

            stream.stream_expression_matched = expression_matched[index];
            stream.regex_matched = self.preferred_regex_index(&stream);
            if !self.keyword.preferred.is_empty() {
                stream.keyword_matched =
                    Some(intersects_haystack(&keyword_haystack(&stream), &self.keyword.preferred));
            }
            survivors.push(stream);
        }
        Ok(survivors)
    }

    fn passes_categories(&self, stream: &ParsedStream) -> bool {
        let file = &stream.parsed_file;
        list_predicate(&single(file.resolution.as_deref()), &self.resolution)
            && list_predicate(&single(file.quality.as_deref()), &self.quality)
            && list_predicate(&single(file.encode.as_deref()), &self.encode)
            && list_predicate(&listed(&file.languages), &self.language)
            && list_predicate(&visual_tag_values(stream), &self.visual_tag)
            && list_predicate(&listed(&file.audio_tags), &self.audio_tag)
            && list_predicate(&listed(&file.audio_channels), &self.audio_channel)
            && list_predicate(
                &vec![stream.stream_type.to_string()],
                &self.stream_type,
            )
    }

    fn passes_regex(&self, stream: &ParsedStream) -> bool {
        let haystack = regex_haystack(stream);
        if self.excluded_regex.iter().any(|re| re.is_match(&haystack)) {
            return false;
        }
        if !self.included_regex.is_empty()
            && !self.included_regex.iter().any(|re| re.is_match(&haystack))
        {
            return false;
        }
        self.required_regex.iter().all(|re| re.is_match(&haystack))
    }

    fn preferred_regex_index(&self, stream: &ParsedStream) -> Option<usize> {
        let haystack = regex_haystack(stream);
        self.preferred_regex
            .iter()
            .position(|re| re.is_match(&haystack))
    }

    fn passes_keywords(&self, stream: &ParsedStream) -> bool {
        let haystack = keyword_haystack(stream);
        if intersects_haystack(&haystack, &self.keyword.excluded) {
            return false;
        }
        if !self.keyword.included.is_empty()
            && !intersects_haystack(&haystack, &self.keyword.included)
        {
            return false;
        }
        self.keyword
            .required
            .iter()
            .all(|keyword| haystack.contains(&keyword.to_lowercase()))
    }

    fn passes_seeders(&self, stream: &ParsedStream) -> bool {
        let seeders = match stream.torrent.as_ref().and_then(|t| t.seeders) {
            Some(s) => s,
            // Unknown seeder counts cannot be judged.
            None => return true,
        };
        for filter in &self.seeders {
            let in_scope = match filter.scope {
                SeedersScope::P2p => stream.stream_type == StreamType::P2p,
                SeedersScope::Cached => stream.is_cached(),
                SeedersScope::Uncached => {
                    stream.service.is_some() && !stream.is_cached()
                }
            };
            if !in_scope {
                continue;
            }
            if let Some(min) = filter.min {
                if seeders < min {
                    return false;
                }
            }
            if let Some(max) = filter.max {
                if seeders > max {
                    return false;
                }
            }
        }
        true
    }

    fn passes_size(&self, stream: &ParsedStream, media_type: MediaType) -> bool {
        let size = match stream.size {
            Some(s) => s,
            None => return true,
        };
        match self.size_range_for(media_type, stream.parsed_file.resolution.as_deref()) {
            Some(range) => range.contains(size),
            None => true,
        }
    }

    /// The most specific configured scope wins: media-type+resolution,
    /// then resolution, then media-type, then global.
    fn size_range_for(
        &self,
        media_type: MediaType,
        resolution: Option<&str>,
    ) -> Option<SizeRange> {
        // Anime follows the series limits.
        let series_like = matches!(media_type, MediaType::Series | MediaType::Anime);
        if let Some(resolution) = resolution {
            let per_media = if series_like {
                self.size.series_resolution.get(resolution)
            } else {
                self.size.movies_resolution.get(resolution)
            };
            if let Some(range) = per_media.filter(|r| !r.is_unbounded()) {
                return Some(*range);
            }
            if let Some(range) = self
                .size
                .resolution
                .get(resolution)
                .filter(|r| !r.is_unbounded())
            {
                return Some(*range);
            }
        }
        let per_media = if series_like {
            self.size.series
        } else {
            self.size.movies
        };
        per_media
            .filter(|r| !r.is_unbounded())
            .or(self.size.global.filter(|r| !r.is_unbounded()))
    }
}

fn regex_haystack(stream: &ParsedStream) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(filename) = &stream.filename {
        parts.push(filename);
    }
    if let Some(folder) = &stream.folder_name {
        parts.push(folder);
    }
    if let Some(indexer) = &stream.indexer {
        parts.push(indexer);
    }
    if let Some(group) = &stream.parsed_file.release_group {
        parts.push(group);
    }
    if let Some(title) = &stream.parsed_file.title {
        parts.push(title);
    }
    parts.join("\n")
}

fn keyword_haystack(stream: &ParsedStream) -> String {
    regex_haystack(stream).to_lowercase()
}

fn intersects_haystack(haystack: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|keyword| haystack.contains(&keyword.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AddonRef, FilterConfig, SeedersFilter, SizeFilter, UserConfig};

    fn stream(resolution: &str) -> ParsedStream {
        let mut s = ParsedStream::error(
            AddonRef {
                instance_id: "a1".into(),
                name: "Addon".into(),
            },
            "x",
            None,
        );
        s.stream_type = StreamType::Http;
        s.error = None;
        s.url = Some("http://example.com/v.mkv".into());
        s.parsed_file.resolution = Some(resolution.into());
        s
    }

    fn config_with(filters: FilterConfig) -> UserConfig {
        UserConfig {
            user_id: "u".into(),
            providers: vec![],
            services: vec![],
            groups: vec![],
            group_behaviour: crate::models::GroupBehaviour::Parallel,
            dynamic_fetch_condition: None,
            filters,
            dedup: Default::default(),
            sort: Default::default(),
            proxy: Default::default(),
            format: Default::default(),
            hide_errors: false,
            hide_errors_for_resources: vec![],
            cache_and_play: vec![],
            trusted_regex: true,
        }
    }

    #[test]
    fn test_excluded_resolution() {
        let mut filters = FilterConfig::default();
        filters.resolution.excluded = vec!["480p".into()];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();

        let streams = vec![stream("2160p"), stream("1080p"), stream("720p"), stream("480p")];
        let out = filterer.apply(streams, MediaType::Movie).unwrap();
        let resolutions: Vec<_> = out
            .iter()
            .map(|s| s.parsed_file.resolution.clone().unwrap())
            .collect();
        assert_eq!(resolutions, vec!["2160p", "1080p", "720p"]);
    }

    #[test]
    fn test_preferred_does_not_eliminate() {
        let mut filters = FilterConfig::default();
        filters.resolution.preferred = vec!["2160p".into(), "1080p".into()];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();
        let out = filterer
            .apply(vec![stream("720p"), stream("480p")], MediaType::Movie)
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_included_requires_intersection() {
        let mut filters = FilterConfig::default();
        filters.resolution.included = vec!["1080p".into()];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();
        let out = filterer
            .apply(vec![stream("1080p"), stream("720p")], MediaType::Movie)
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_size_scope_most_specific_wins() {
        let mut filters = FilterConfig::default();
        filters.size = SizeFilter {
            global: Some(crate::models::SizeRange { min: 0, max: 100 }),
            movies: None,
            series: None,
            resolution: Default::default(),
            movies_resolution: [(
                "1080p".to_string(),
                crate::models::SizeRange { min: 0, max: 1000 },
            )]
            .into_iter()
            .collect(),
            series_resolution: Default::default(),
        };
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();

        let mut big = stream("1080p");
        big.size = Some(500);
        // passes the 1080p movie scope even though the global cap is 100
        let out = filterer.apply(vec![big.clone()], MediaType::Movie).unwrap();
        assert_eq!(out.len(), 1);
        // a series stream falls back to the global cap
        let out = filterer.apply(vec![big], MediaType::Series).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_seeders_scope() {
        let mut filters = FilterConfig::default();
        filters.seeders = vec![SeedersFilter {
            scope: SeedersScope::P2p,
            min: Some(5),
            max: None,
        }];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();

        let mut low = stream("1080p");
        low.stream_type = StreamType::P2p;
        low.url = None;
        low.torrent = Some(crate::models::TorrentInfo {
            info_hash: "abc".into(),
            file_idx: None,
            seeders: Some(2),
            sources: vec![],
        });
        let out = filterer.apply(vec![low], MediaType::Movie).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_untrusted_regex_requires_allow_list() {
        let mut filters = FilterConfig::default();
        filters.regex.excluded = vec!["cam".into()];
        let mut config = config_with(filters);
        config.trusted_regex = false;
        assert!(matches!(
            Filterer::new(&config, &[]),
            Err(FilterError::RegexNotAllowed { .. })
        ));
        assert!(Filterer::new(&config, &["cam".to_string()]).is_ok());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let mut filters = FilterConfig::default();
        filters.regex.excluded = vec!["([".into()];
        assert!(matches!(
            Filterer::new(&config_with(filters), &[]),
            Err(FilterError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_expression_exclude() {
        let mut filters = FilterConfig::default();
        filters.stream_expression.excluded = vec![r#"resolution = "480p""#.into()];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();
        let out = filterer
            .apply(vec![stream("1080p"), stream("480p")], MediaType::Movie)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parsed_file.resolution.as_deref(), Some("1080p"));
    }

    #[test]
    fn test_error_streams_pass_through() {
        let error = ParsedStream::error(
            AddonRef {
                instance_id: "a1".into(),
                name: "Addon".into(),
            },
            "provider timed out",
            None,
        );
        let mut filters = FilterConfig::default();
        filters.resolution.included = vec!["1080p".into()];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();
        let out = filterer.apply(vec![error], MediaType::Movie).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream_type, StreamType::Error);
    }

    #[test]
    fn test_visual_tag_synthetic_combos() {
        let mut filters = FilterConfig::default();
        filters.visual_tag.excluded = vec!["DV Only".into()];
        let filterer = Filterer::new(&config_with(filters), &[]).unwrap();

        let mut dv_only = stream("2160p");
        dv_only.parsed_file.visual_tags = vec!["DV".into()];
        let mut dv_hdr = stream("2160p");
        dv_hdr.parsed_file.visual_tags = vec!["DV".into(), "HDR10".into()];

        let out = filterer
            .apply(vec![dv_only, dv_hdr], MediaType::Movie)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parsed_file.visual_tags.len(), 2);
    }
}
