//! Per-user pipeline configuration: providers, groups, filters, dedup,
//! sorting, proxy and formatting options.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::provider::{ProviderDescriptor, Resource, ServiceCredential, ServiceId};
use crate::models::stream::StreamType;

/// Four-list filter for one categorical attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogFilter {
    /// Stream fails if its value intersects this list.
    pub excluded: Vec<String>,
    /// If non-empty, the stream's value must intersect.
    pub included: Vec<String>,
    /// Stream must match every listed token.
    pub required: Vec<String>,
    /// Non-eliminating; feeds sort ordering only.
    pub preferred: Vec<String>,
}

impl CatalogFilter {
    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
            && self.included.is_empty()
            && self.required.is_empty()
            && self.preferred.is_empty()
    }
}

/// Which streams a seeders range applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedersScope {
    P2p,
    Cached,
    Uncached,
}

/// Seeder-count bound for a scope. `None` means no bound on that side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedersFilter {
    pub scope: SeedersScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

/// Half-open size interval `[min, max)` in bytes; zero means unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SizeRange {
    pub min: u64,
    pub max: u64,
}

impl SizeRange {
    pub fn contains(&self, size: u64) -> bool {
        if self.min > 0 && size < self.min {
            return false;
        }
        if self.max > 0 && size >= self.max {
            return false;
        }
        true
    }

    pub fn is_unbounded(&self) -> bool {
        self.min == 0 && self.max == 0
    }
}

/// Size limits with media-type and per-resolution scopes. The most specific
/// scope that defines a bound wins: media-type+resolution, then resolution,
/// then media-type, then global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SizeFilter {
    pub global: Option<SizeRange>,
    pub movies: Option<SizeRange>,
    pub series: Option<SizeRange>,
    pub resolution: HashMap<String, SizeRange>,
    pub movies_resolution: HashMap<String, SizeRange>,
    pub series_resolution: HashMap<String, SizeRange>,
}

/// Stream-expression selectors. `excluded` removes matches, `required`
/// keeps only matches, `preferred` feeds sorting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamExpressionFilter {
    pub excluded: Vec<String>,
    pub required: Vec<String>,
    pub preferred: Vec<String>,
}

/// All filtering configuration for one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub resolution: CatalogFilter,
    pub quality: CatalogFilter,
    pub language: CatalogFilter,
    pub visual_tag: CatalogFilter,
    pub audio_tag: CatalogFilter,
    pub audio_channel: CatalogFilter,
    pub stream_type: CatalogFilter,
    pub encode: CatalogFilter,
    pub regex: CatalogFilter,
    pub keyword: CatalogFilter,
    pub stream_expression: StreamExpressionFilter,
    pub seeders: Vec<SeedersFilter>,
    pub size: SizeFilter,
}

/// Fingerprint components used to decide two streams are "the same".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DedupKey {
    Filename,
    InfoHash,
    SmartDetect,
}

/// Survivor policy within one duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    SingleResult,
    PerService,
    PerAddon,
    Disabled,
}

/// How cached and uncached variants of the same content coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiGroupBehaviour {
    KeepAll,
    Aggressive,
    Conservative,
}

/// Deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupConfig {
    #[serde(default)]
    pub keys: Vec<DedupKey>,
    /// Mode per stream type; types absent here fall back to `default_mode`.
    #[serde(default)]
    pub modes: HashMap<StreamType, DedupMode>,
    #[serde(default = "DedupConfig::default_mode")]
    pub default_mode: DedupMode,
    #[serde(default = "DedupConfig::default_multi_group")]
    pub multi_group_behaviour: MultiGroupBehaviour,
}

impl DedupConfig {
    fn default_mode() -> DedupMode {
        DedupMode::Disabled
    }

    fn default_multi_group() -> MultiGroupBehaviour {
        MultiGroupBehaviour::KeepAll
    }

    pub fn mode_for(&self, stream_type: StreamType) -> DedupMode {
        self.modes.get(&stream_type).copied().unwrap_or(self.default_mode)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            modes: HashMap::new(),
            default_mode: Self::default_mode(),
            multi_group_behaviour: Self::default_multi_group(),
        }
    }
}

/// Sortable stream attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    Quality,
    Resolution,
    Language,
    VisualTag,
    AudioTag,
    AudioChannel,
    StreamType,
    Encode,
    Size,
    Service,
    Seeders,
    Addon,
    RegexPatterns,
    Cached,
    Library,
    Keyword,
    StreamExpressionMatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort criterion with direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortCriterion {
    pub key: SortKey,
    pub direction: SortDirection,
}

/// Global criteria plus per-request-type and per-cache-partition overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SortConfig {
    pub global: Vec<SortCriterion>,
    pub movies: Option<Vec<SortCriterion>>,
    pub series: Option<Vec<SortCriterion>>,
    pub anime: Option<Vec<SortCriterion>>,
    /// Criteria for the cached partition when `cached` leads the list.
    pub cached: Option<Vec<SortCriterion>>,
    /// Criteria for the uncached partition when `cached` leads the list.
    pub uncached: Option<Vec<SortCriterion>>,
}

/// Playback proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Proxy endpoint the rewritten URLs point at.
    pub url: Option<String>,
    /// Public URL to use in rewritten links when it differs from `url`.
    pub public_url: Option<String>,
    pub credentials: Option<String>,
    pub proxied_addons: Vec<String>,
    pub proxied_services: Vec<ServiceId>,
}

impl ProxyConfig {
    pub fn public_base(&self) -> Option<&str> {
        self.public_url.as_deref().or(self.url.as_deref())
    }
}

/// Client-facing name/description templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatConfig {
    pub name_template: String,
    pub description_template: String,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            name_template: "{stream.proxied::=true[🕵️ ||]}{stream.type::=p2p[[P2P] ||]}{stream.service.cached::=true[⚡ ||]}{stream.service.cached::=false[⏳ ||]}{stream.addon.name} {stream.parsedFile.resolution::exists[{stream.parsedFile.resolution}||]}{stream.library::=true[ ☁️||]}".into(),
            description_template: "{stream.filename::exists[{stream.filename}||{stream.parsedFile.title}]}\n{stream.size::exists[💾 {stream.size::bytes} ||]}{stream.torrent.seeders::exists[👥 {stream.torrent.seeders} ||]}{stream.indexer::exists[🔍 {stream.indexer}||]}\n{stream.parsedFile.languages::exists[🌐 {stream.parsedFile.languages::join(, )}||]}".into(),
        }
    }
}

/// How provider groups are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBehaviour {
    Sequential,
    Parallel,
}

/// A named subset of providers fetched under a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderGroup {
    /// Provider instance ids in this group. Unknown ids are removed by the
    /// invalid-reference pre-pass, never errored on.
    pub providers: Vec<String>,
    /// Group condition evaluated against the streams gathered so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// The complete per-user pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub user_id: String,
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
    /// Enabled services in ranking order.
    #[serde(default)]
    pub services: Vec<ServiceCredential>,
    #[serde(default)]
    pub groups: Vec<ProviderGroup>,
    #[serde(default = "UserConfig::default_group_behaviour")]
    pub group_behaviour: GroupBehaviour,
    /// When set and it evaluates true on the initial zero-stream context,
    /// all groups are fetched; otherwise groups gate each other.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_fetch_condition: Option<String>,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub sort: SortConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub hide_errors: bool,
    #[serde(default)]
    pub hide_errors_for_resources: Vec<Resource>,
    /// Stream types for which an uncached debrid resolve waits for the
    /// cache instead of redirecting to the downloading placeholder.
    #[serde(default)]
    pub cache_and_play: Vec<StreamType>,
    /// Operator-granted permission to use arbitrary regex patterns.
    #[serde(default)]
    pub trusted_regex: bool,
}

impl UserConfig {
    fn default_group_behaviour() -> GroupBehaviour {
        GroupBehaviour::Parallel
    }

    /// Ranking position of a service; unknown services sort last.
    pub fn service_rank(&self, id: ServiceId) -> usize {
        self.services
            .iter()
            .position(|s| s.service_id == id)
            .unwrap_or(usize::MAX)
    }

    /// Ranking position of a provider; unknown providers sort last.
    pub fn addon_rank(&self, instance_id: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.instance_id == instance_id)
            .unwrap_or(usize::MAX)
    }

    pub fn provider(&self, instance_id: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.instance_id == instance_id)
    }

    /// Remove group references to provider instance ids that do not exist.
    pub fn prune_invalid_references(&mut self) {
        let known: Vec<String> = self.providers.iter().map(|p| p.instance_id.clone()).collect();
        for group in &mut self.groups {
            group.providers.retain(|id| known.contains(id));
        }
        self.groups.retain(|g| !g.providers.is_empty());
        let known_services: Vec<ServiceId> = self.services.iter().map(|s| s.service_id).collect();
        self.proxy
            .proxied_services
            .retain(|id| known_services.contains(id));
        self.proxy.proxied_addons.retain(|id| known.contains(id));
    }

    /// Structural validation with readable, path-qualified messages.
    pub fn validate(&self, limits: &ConfigLimits) -> Result<(), String> {
        for provider in &self.providers {
            provider
                .validate()
                .map_err(|e| format!("providers.{}: {}", provider.instance_id, e))?;
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(&provider.instance_id) {
                return Err(format!(
                    "providers: duplicate instanceId '{}'",
                    provider.instance_id
                ));
            }
        }
        if self.groups.len() > limits.max_groups {
            return Err(format!(
                "groups: at most {} groups are allowed, got {}",
                limits.max_groups,
                self.groups.len()
            ));
        }
        let expr_count = self.filters.stream_expression.excluded.len()
            + self.filters.stream_expression.required.len()
            + self.filters.stream_expression.preferred.len();
        if expr_count > limits.max_stream_expression_filters {
            return Err(format!(
                "filters.streamExpression: at most {} expressions are allowed, got {}",
                limits.max_stream_expression_filters, expr_count
            ));
        }
        let keyword_count = self.filters.keyword.excluded.len()
            + self.filters.keyword.included.len()
            + self.filters.keyword.required.len()
            + self.filters.keyword.preferred.len();
        if keyword_count > limits.max_keyword_filters {
            return Err(format!(
                "filters.keyword: at most {} keywords are allowed, got {}",
                limits.max_keyword_filters, keyword_count
            ));
        }
        Ok(())
    }
}

/// Operator limits applied during config validation.
#[derive(Debug, Clone)]
pub struct ConfigLimits {
    pub max_groups: usize,
    pub max_stream_expression_filters: usize,
    pub max_keyword_filters: usize,
}

impl Default for ConfigLimits {
    fn default() -> Self {
        Self {
            max_groups: 10,
            max_stream_expression_filters: 20,
            max_keyword_filters: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_range_half_open() {
        let range = SizeRange {
            min: 100,
            max: 1000,
        };
        assert!(!range.contains(99));
        assert!(range.contains(100));
        assert!(range.contains(999));
        assert!(!range.contains(1000));
    }

    #[test]
    fn test_size_range_zero_is_unbounded() {
        let range = SizeRange { min: 0, max: 0 };
        assert!(range.contains(0));
        assert!(range.contains(u64::MAX));
    }

    #[test]
    fn test_prune_invalid_references() {
        let mut config = UserConfig {
            user_id: "u1".into(),
            providers: vec![],
            services: vec![],
            groups: vec![ProviderGroup {
                providers: vec!["ghost".into()],
                condition: None,
            }],
            group_behaviour: GroupBehaviour::Parallel,
            dynamic_fetch_condition: None,
            filters: FilterConfig::default(),
            dedup: DedupConfig::default(),
            sort: SortConfig::default(),
            proxy: ProxyConfig::default(),
            format: FormatConfig::default(),
            hide_errors: false,
            hide_errors_for_resources: vec![],
            cache_and_play: vec![],
            trusted_regex: false,
        };
        config.prune_invalid_references();
        assert!(config.groups.is_empty());
    }

    #[test]
    fn test_max_groups_enforced() {
        let groups = (0..3)
            .map(|i| ProviderGroup {
                providers: vec![format!("p{}", i)],
                condition: None,
            })
            .collect();
        let config = UserConfig {
            user_id: "u1".into(),
            providers: vec![],
            services: vec![],
            groups,
            group_behaviour: GroupBehaviour::Sequential,
            dynamic_fetch_condition: None,
            filters: FilterConfig::default(),
            dedup: DedupConfig::default(),
            sort: SortConfig::default(),
            proxy: ProxyConfig::default(),
            format: FormatConfig::default(),
            hide_errors: false,
            hide_errors_for_resources: vec![],
            cache_and_play: vec![],
            trusted_regex: false,
        };
        let limits = ConfigLimits {
            max_groups: 2,
            ..Default::default()
        };
        let err = config.validate(&limits).unwrap_err();
        assert!(err.contains("groups"));
    }
}
