//! Orchestrator
//!
//! The per-request composition root: resolves which provider groups to
//! query under the dynamic-fetch rule, fans out with bounded concurrency
//! and per-provider timeouts, then drives the merged streams through
//! parse/enrich → filter → dedup → sort → proxify → format. Provider
//! failures surface as inline error streams and never abort the request.
//! Debrid-eligible streams leave with opaque playback URLs resolved at
//! click time.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{
    AddonRef, GroupBehaviour, ParsedStream, ProviderGroup, RawStream, Resource, StoreAuth,
    StreamType, TitleMetadata, UserConfig,
};
use crate::services::addon::{AddonFetcher, StreamQuery};
use crate::services::crypto::Crypto;
use crate::services::dedupe::Deduplicator;
use crate::services::enrich::Enricher;
use crate::services::expression::{self, ExprError};
use crate::services::filter::{FilterError, Filterer};
use crate::services::format::Formatter;
use crate::services::metadata::MetadataStore;
use crate::services::proxify::Proxifier;
use crate::services::sort::Sorter;

/// Request-fatal pipeline failure. Only configuration problems abort a
/// request; provider failures are folded into the stream list.
#[derive(Debug)]
pub enum PipelineError {
    InvalidConfig(String),
    Filter(FilterError),
    Expression(ExprError),
    Internal(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            PipelineError::Filter(e) => write!(f, "{}", e),
            PipelineError::Expression(e) => write!(f, "{}", e),
            PipelineError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<FilterError> for PipelineError {
    fn from(e: FilterError) -> Self {
        PipelineError::Filter(e)
    }
}

impl From<ExprError> for PipelineError {
    fn from(e: ExprError) -> Self {
        PipelineError::Expression(e)
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    fetcher: Arc<AddonFetcher>,
    metadata: Arc<MetadataStore>,
    crypto: Option<Crypto>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<AddonFetcher>,
        metadata: Arc<MetadataStore>,
        crypto: Option<Crypto>,
    ) -> Self {
        Self {
            config,
            fetcher,
            metadata,
            crypto,
        }
    }

    /// Handle one stream request end to end, returning the client-facing
    /// wire records in final order.
    pub async fn handle(
        &self,
        query: &StreamQuery,
        user: &UserConfig,
    ) -> Result<Vec<RawStream>, PipelineError> {
        let mut user = user.clone();
        user.prune_invalid_references();
        user.validate(&self.config.limits())
            .map_err(PipelineError::InvalidConfig)?;

        let filterer = Filterer::new(&user, &self.config.regex_allow_list)?;
        if let Some(condition) = &user.dynamic_fetch_condition {
            expression::validate_condition(condition)?;
        }
        for group in &user.groups {
            if let Some(condition) = &group.condition {
                expression::validate_condition(condition)?;
            }
        }

        let groups = self.effective_groups(&user, query);
        let streams = self.fetch_groups(&user, query, &groups).await?;

        // Split out passthrough providers and inline errors before the
        // eliminating stages.
        let mut passthrough = Vec::new();
        let mut candidates = Vec::new();
        for stream in streams {
            let is_passthrough = user
                .provider(&stream.addon.instance_id)
                .map(|p| p.result_passthrough)
                .unwrap_or(false);
            if is_passthrough {
                passthrough.push(stream);
            } else {
                candidates.push(stream);
            }
        }

        let filtered = filterer.apply(candidates, query.media_type)?;
        let deduped = Deduplicator::new(&user).apply(filtered);
        let sorted = Sorter::new(&user).sort(deduped, query.media_type);

        let mut final_streams = passthrough;
        final_streams.extend(sorted);

        Proxifier::new(&user, &self.config).apply(&mut final_streams);

        let metadata = self.build_metadata(query, &final_streams);
        let metadata_id = match self.metadata.put(&metadata).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("failed to store title metadata: {}", e);
                None
            }
        };

        if let Some(metadata_id) = &metadata_id {
            self.link_playback_urls(&mut final_streams, &user, metadata_id);
        }

        let formatter = Formatter::new(&user.format);
        Ok(final_streams
            .into_iter()
            .map(|stream| self.to_wire(stream, &user, &formatter))
            .collect())
    }

    /// Provider groups for this request. With no explicit groups, every
    /// provider supporting the resource/type forms one group.
    fn effective_groups(&self, user: &UserConfig, query: &StreamQuery) -> Vec<ProviderGroup> {
        let supported: Vec<String> = user
            .providers
            .iter()
            .filter(|p| p.supports(query.resource, query.media_type))
            .map(|p| p.instance_id.clone())
            .collect();

        if user.groups.is_empty() {
            return vec![ProviderGroup {
                providers: supported,
                condition: None,
            }];
        }
        user.groups
            .iter()
            .map(|group| ProviderGroup {
                providers: group
                    .providers
                    .iter()
                    .filter(|id| supported.contains(id))
                    .cloned()
                    .collect(),
                condition: group.condition.clone(),
            })
            .filter(|group| !group.providers.is_empty())
            .collect()
    }

    /// Fetch the groups under the configured scheduling rule. The merge
    /// order is deterministic: group order, then provider order within the
    /// group, regardless of completion order.
    async fn fetch_groups(
        &self,
        user: &UserConfig,
        query: &StreamQuery,
        groups: &[ProviderGroup],
    ) -> Result<Vec<ParsedStream>, PipelineError> {
        // The dynamic-fetch condition is evaluated on the initial
        // zero-stream context; true means fetch everything at once.
        let fetch_all = match &user.dynamic_fetch_condition {
            Some(condition) => expression::check_condition(condition, &[])?,
            None => false,
        };

        let mut merged: Vec<ParsedStream> = Vec::new();

        if fetch_all || user.group_behaviour == GroupBehaviour::Parallel {
            let mut all: Vec<&str> = Vec::new();
            for group in groups {
                for id in &group.providers {
                    all.push(id);
                }
            }
            merged = self.fetch_providers(user, query, &all).await;
        } else {
            for (index, group) in groups.iter().enumerate() {
                if index > 0 {
                    let proceed = match &group.condition {
                        Some(condition) => expression::check_condition(condition, &merged)?,
                        None => !merged
                            .iter()
                            .any(|s| !matches!(s.stream_type, StreamType::Error)),
                    };
                    if !proceed {
                        debug!("group {} skipped, previous groups satisfied the request", index);
                        continue;
                    }
                }
                let ids: Vec<&str> = group.providers.iter().map(|s| s.as_str()).collect();
                let streams = self.fetch_providers(user, query, &ids).await;
                merged.extend(streams);
            }
        }

        Ok(merged)
    }

    /// Bounded parallel fan-out over providers; one task per provider, a
    /// failure in one never affects the others.
    async fn fetch_providers(
        &self,
        user: &UserConfig,
        query: &StreamQuery,
        instance_ids: &[&str],
    ) -> Vec<ParsedStream> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_parallelism.max(1)));
        let mut handles = Vec::new();

        for id in instance_ids {
            let provider = match user.provider(id) {
                Some(p) => p.clone(),
                None => continue,
            };
            let fetcher = self.fetcher.clone();
            let query = query.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = fetcher.fetch_streams(&provider, &query).await;
                (provider, result)
            }));
        }

        let mut merged = Vec::new();
        for handle in handles {
            let (provider, result) = match handle.await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("provider task panicked: {}", e);
                    continue;
                }
            };
            match result {
                Ok(raws) => {
                    merged.extend(Enricher::enrich_all(&provider, raws));
                }
                Err(e) => {
                    warn!("provider {} failed: {}", provider.display_name, e);
                    if !self.errors_hidden(user, query.resource) {
                        merged.push(ParsedStream::error(
                            AddonRef {
                                instance_id: provider.instance_id.clone(),
                                name: provider.display_name.clone(),
                            },
                            format!("[❌] {}", provider.display_name),
                            Some(e.to_string()),
                        ));
                    }
                }
            }
        }
        merged
    }

    fn errors_hidden(&self, user: &UserConfig, resource: Resource) -> bool {
        user.hide_errors || user.hide_errors_for_resources.contains(&resource)
    }

    /// Title metadata for click-time file picking: episode numbers come
    /// from the request id, titles and year from the parsed streams.
    fn build_metadata(&self, query: &StreamQuery, streams: &[ParsedStream]) -> TitleMetadata {
        let (season, episode) = parse_series_id(&query.id);
        let mut titles: Vec<String> = Vec::new();
        let mut year = None;
        for stream in streams {
            if let Some(title) = &stream.parsed_file.title {
                if !titles.iter().any(|t| t.eq_ignore_ascii_case(title)) {
                    titles.push(title.clone());
                }
            }
            if year.is_none() {
                year = stream.parsed_file.year;
            }
            if titles.len() >= 5 {
                break;
            }
        }
        TitleMetadata {
            titles,
            year,
            season,
            episode,
            absolute_episode: None,
        }
    }

    /// Attach opaque playback URLs to debrid-eligible streams: torrent
    /// streams attributed to a service but carrying no upstream URL.
    /// Resolution happens at click time, never during aggregation.
    fn link_playback_urls(
        &self,
        streams: &mut [ParsedStream],
        user: &UserConfig,
        metadata_id: &str,
    ) {
        let crypto = match &self.crypto {
            Some(c) => c,
            None => return,
        };
        let credentials: HashMap<_, _> = user
            .services
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| {
                let key = self
                    .config
                    .forced_service_api_keys
                    .get(&s.service_id)
                    .map(|k| k.as_str())
                    .or_else(|| s.api_key())
                    .or_else(|| {
                        self.config
                            .default_service_api_keys
                            .get(&s.service_id)
                            .map(|k| k.as_str())
                    })?;
                Some((s.service_id, key.to_string()))
            })
            .collect();

        for stream in streams.iter_mut() {
            if stream.url.is_some() {
                continue;
            }
            let service = match &stream.service {
                Some(s) => s,
                None => continue,
            };
            let torrent = match &stream.torrent {
                Some(t) => t,
                None => continue,
            };
            let credential = match credentials.get(&service.id) {
                Some(c) => c,
                None => continue,
            };

            let auth = StoreAuth {
                id: service.id,
                credential: credential.clone(),
            };
            let sealed = match serde_json::to_string(&auth) {
                Ok(json) => crypto.seal(&json).to_raw(),
                Err(_) => continue,
            };

            let file_info = crate::models::FileInfo {
                kind: if stream.stream_type == StreamType::Usenet {
                    "usenet".into()
                } else {
                    "torrent".into()
                },
                hash: torrent.info_hash.clone(),
                index: torrent.file_idx,
                sources: torrent.sources.clone(),
                nzb: None,
                cache_and_play: Some(user.cache_and_play.contains(&stream.stream_type)),
                filename: stream.filename.clone(),
            };
            let info_b64 = match serde_json::to_vec(&file_info) {
                Ok(bytes) => URL_SAFE_NO_PAD.encode(bytes),
                Err(_) => continue,
            };

            let filename = stream
                .filename
                .clone()
                .unwrap_or_else(|| "stream.mp4".to_string());
            stream.url = Some(format!(
                "{}/playback/{}/{}/{}/{}",
                self.config.base_url.trim_end_matches('/'),
                sealed,
                info_b64,
                metadata_id,
                filename
            ));
            stream.stream_type = StreamType::Debrid;
        }
    }

    /// Convert a final pipeline stream into the player-facing wire record.
    fn to_wire(
        &self,
        stream: ParsedStream,
        user: &UserConfig,
        formatter: &Formatter,
    ) -> RawStream {
        let format_passthrough = user
            .provider(&stream.addon.instance_id)
            .map(|p| p.format_passthrough)
            .unwrap_or(false);

        let (name, description) = if stream.stream_type == StreamType::Error {
            let error = stream.error.clone().unwrap_or(crate::models::StreamError {
                title: "unknown error".into(),
                description: None,
            });
            (error.title, error.description.unwrap_or_default())
        } else if format_passthrough {
            (
                stream.addon.name.clone(),
                stream.filename.clone().unwrap_or_default(),
            )
        } else {
            let rendered = formatter.format(&stream);
            (rendered.name, rendered.description)
        };

        RawStream {
            name: Some(name),
            description: Some(description),
            url: stream.url.clone(),
            external_url: stream
                .external_url
                .clone()
                .or_else(|| {
                    // error streams need a no-op target for players
                    (stream.stream_type == StreamType::Error).then(|| "stremio:///".to_string())
                }),
            yt_id: stream.yt_id.clone(),
            info_hash: match stream.stream_type {
                StreamType::P2p => stream.torrent.as_ref().map(|t| t.info_hash.clone()),
                _ => None,
            },
            file_idx: match stream.stream_type {
                StreamType::P2p => stream.torrent.as_ref().and_then(|t| t.file_idx),
                _ => None,
            },
            sources: match stream.stream_type {
                StreamType::P2p => stream
                    .torrent
                    .as_ref()
                    .map(|t| t.sources.clone())
                    .unwrap_or_default(),
                _ => Vec::new(),
            },
            subtitles: stream.subtitles.clone(),
            behavior_hints: Some(crate::models::BehaviorHints {
                binge_group: stream.binge_group.clone(),
                filename: stream.filename.clone(),
                video_size: stream.size,
                proxy_headers: None,
                not_web_ready: stream.not_web_ready,
                country_whitelist: stream.country_whitelist.clone(),
            }),
        }
    }
}

/// Extract season/episode from a series request id like `tt0903747:3:5`.
fn parse_series_id(id: &str) -> (Option<u32>, Option<u32>) {
    let parts: Vec<&str> = id.split(':').collect();
    if parts.len() >= 3 {
        let season = parts[parts.len() - 2].parse().ok();
        let episode = parts[parts.len() - 1].parse().ok();
        if season.is_some() && episode.is_some() {
            return (season, episode);
        }
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_series_id() {
        assert_eq!(parse_series_id("tt0903747:3:5"), (Some(3), Some(5)));
        assert_eq!(parse_series_id("tt0111161"), (None, None));
        assert_eq!(parse_series_id("kitsu:1234:12"), (Some(1234), Some(12)));
    }
}
