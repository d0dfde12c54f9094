//! Deduplicator
//!
//! Collapses near-duplicate streams. Streams sharing any enabled
//! fingerprint key land in one duplicate group; the per-stream-type mode
//! picks survivors inside the group, ranked by the user's configured
//! service and addon order. The multi-group behaviour decides whether
//! cached and uncached variants of the same content may coexist.

use std::collections::HashMap;

use crate::models::{
    DedupKey, DedupMode, MultiGroupBehaviour, ParsedStream, ServiceId, StreamType, UserConfig,
};

/// Strip everything but alphanumerics, lowercased. Tolerant enough that
/// `Movie.2024.mkv` and `movie 2024 mkv` collide.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Composite fingerprint from release attributes, for streams whose
/// filenames differ cosmetically.
fn smart_fingerprint(stream: &ParsedStream) -> Option<String> {
    let file = &stream.parsed_file;
    let base = file
        .title
        .as_deref()
        .or(stream.filename.as_deref())?;
    let mut parts = vec![normalize(base)];
    if let Some(year) = file.year {
        parts.push(year.to_string());
    }
    if let (Some(season), Some(episode)) = (file.season, file.episode) {
        parts.push(format!("s{}e{}", season, episode));
    }
    if let Some(resolution) = &file.resolution {
        parts.push(normalize(resolution));
    }
    if let Some(quality) = &file.quality {
        parts.push(normalize(quality));
    }
    if let Some(encode) = &file.encode {
        parts.push(normalize(encode));
    }
    Some(parts.join(":"))
}

fn fingerprint(stream: &ParsedStream, key: DedupKey) -> Option<String> {
    match key {
        DedupKey::Filename => stream
            .filename
            .as_deref()
            .map(normalize)
            .filter(|f| !f.is_empty()),
        DedupKey::InfoHash => stream
            .torrent
            .as_ref()
            .map(|t| t.info_hash.to_lowercase()),
        DedupKey::SmartDetect => smart_fingerprint(stream),
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

pub struct Deduplicator<'a> {
    config: &'a UserConfig,
}

impl<'a> Deduplicator<'a> {
    pub fn new(config: &'a UserConfig) -> Self {
        Self { config }
    }

    /// Collapse duplicates. Survivors keep their input order, so the pass
    /// is idempotent: running it twice equals running it once.
    pub fn apply(&self, streams: Vec<ParsedStream>) -> Vec<ParsedStream> {
        let dedup = &self.config.dedup;
        if dedup.keys.is_empty() {
            return streams;
        }

        let n = streams.len();
        let mut groups = UnionFind::new(n);
        let mut seen: HashMap<(DedupKey, String), usize> = HashMap::new();

        for (index, stream) in streams.iter().enumerate() {
            if matches!(
                stream.stream_type,
                StreamType::Error | StreamType::Statistic
            ) {
                continue;
            }
            for key in &dedup.keys {
                if let Some(fp) = fingerprint(stream, *key) {
                    match seen.get(&(*key, fp.clone())) {
                        Some(&first) => groups.union(first, index),
                        None => {
                            seen.insert((*key, fp), index);
                        }
                    }
                }
            }
        }

        let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
        for index in 0..n {
            if matches!(
                streams[index].stream_type,
                StreamType::Error | StreamType::Statistic
            ) {
                continue;
            }
            members.entry(groups.find(index)).or_default().push(index);
        }

        let mut removed = vec![false; n];
        for group in members.values() {
            if group.len() < 2 {
                continue;
            }
            self.prune_multi_group(&streams, group, &mut removed);
            self.prune_by_mode(&streams, group, &mut removed);
        }

        streams
            .into_iter()
            .enumerate()
            .filter(|(index, _)| !removed[*index])
            .map(|(_, stream)| stream)
            .collect()
    }

    /// Cached/uncached coexistence inside one duplicate group.
    ///
    /// `aggressive` drops every uncached service variant once any service
    /// holds a cached copy. `conservative` only drops a service's uncached
    /// copy when that same service also holds a cached one; services with
    /// nothing cached keep their best uncached copy.
    fn prune_multi_group(
        &self,
        streams: &[ParsedStream],
        group: &[usize],
        removed: &mut [bool],
    ) {
        match self.config.dedup.multi_group_behaviour {
            MultiGroupBehaviour::KeepAll => {}
            MultiGroupBehaviour::Aggressive => {
                let any_cached = group.iter().any(|&i| streams[i].is_cached());
                if any_cached {
                    for &i in group {
                        if streams[i].service.is_some() && !streams[i].is_cached() {
                            removed[i] = true;
                        }
                    }
                }
            }
            MultiGroupBehaviour::Conservative => {
                let mut cached_services: Vec<ServiceId> = Vec::new();
                for &i in group {
                    if let Some(service) = &streams[i].service {
                        if service.cached && !cached_services.contains(&service.id) {
                            cached_services.push(service.id);
                        }
                    }
                }
                for &i in group {
                    if let Some(service) = &streams[i].service {
                        if !service.cached && cached_services.contains(&service.id) {
                            removed[i] = true;
                        }
                    }
                }
            }
        }
    }

    /// Survivor selection per stream type within one duplicate group.
    fn prune_by_mode(&self, streams: &[ParsedStream], group: &[usize], removed: &mut [bool]) {
        let mut by_type: HashMap<StreamType, Vec<usize>> = HashMap::new();
        for &i in group {
            if removed[i] {
                continue;
            }
            by_type.entry(streams[i].stream_type).or_default().push(i);
        }

        for (stream_type, indices) in by_type {
            if indices.len() < 2 {
                continue;
            }
            match self.config.dedup.mode_for(stream_type) {
                DedupMode::Disabled => {}
                DedupMode::SingleResult => {
                    let best = self.best_of(streams, &indices);
                    for i in indices {
                        if i != best {
                            removed[i] = true;
                        }
                    }
                }
                DedupMode::PerService => {
                    let mut per_service: HashMap<Option<ServiceId>, Vec<usize>> = HashMap::new();
                    for i in indices {
                        let service = streams[i].service.as_ref().map(|s| s.id);
                        per_service.entry(service).or_default().push(i);
                    }
                    for bucket in per_service.values() {
                        let best = self.best_of(streams, bucket);
                        for &i in bucket {
                            if i != best {
                                removed[i] = true;
                            }
                        }
                    }
                }
                DedupMode::PerAddon => {
                    let mut per_addon: HashMap<&str, Vec<usize>> = HashMap::new();
                    for &i in &indices {
                        per_addon
                            .entry(streams[i].addon.instance_id.as_str())
                            .or_default()
                            .push(i);
                    }
                    for bucket in per_addon.values() {
                        let best = self.best_of(streams, bucket);
                        for &i in bucket {
                            if i != best {
                                removed[i] = true;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Highest-ranked service, then highest-ranked addon, then input order.
    fn best_of(&self, streams: &[ParsedStream], indices: &[usize]) -> usize {
        *indices
            .iter()
            .min_by_key(|&&i| {
                let stream = &streams[i];
                let service_rank = stream
                    .service
                    .as_ref()
                    .map(|s| self.config.service_rank(s.id))
                    .unwrap_or(usize::MAX);
                (service_rank, self.config.addon_rank(&stream.addon.instance_id), i)
            })
            .expect("best_of called with non-empty indices")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AddonRef, DedupConfig, ProviderDescriptor, Resource, ServiceCredential, ServiceRef,
        TorrentInfo,
    };
    use std::collections::HashMap as StdHashMap;

    fn provider(id: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            instance_id: id.into(),
            manifest_url: format!("https://{}/manifest.json", id),
            display_name: id.to_uppercase(),
            identifier: id.into(),
            short_id: id.into(),
            timeout_ms: 5000,
            resources: vec![Resource::Stream],
            media_types: vec![],
            extra_headers: StdHashMap::new(),
            force_to_top: false,
            library: false,
            format_passthrough: false,
            result_passthrough: false,
        }
    }

    fn credential(id: ServiceId) -> ServiceCredential {
        ServiceCredential {
            service_id: id,
            enabled: true,
            credential_map: StdHashMap::new(),
        }
    }

    fn config(dedup: DedupConfig) -> UserConfig {
        UserConfig {
            user_id: "u".into(),
            providers: vec![provider("p1"), provider("p2")],
            services: vec![
                credential(ServiceId::RealDebrid),
                credential(ServiceId::Torbox),
            ],
            groups: vec![],
            group_behaviour: crate::models::GroupBehaviour::Parallel,
            dynamic_fetch_condition: None,
            filters: Default::default(),
            dedup,
            sort: Default::default(),
            proxy: Default::default(),
            format: Default::default(),
            hide_errors: false,
            hide_errors_for_resources: vec![],
            cache_and_play: vec![],
            trusted_regex: false,
        }
    }

    fn torrent_stream(
        id: &str,
        addon: &str,
        hash: &str,
        service: Option<(ServiceId, bool)>,
    ) -> ParsedStream {
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
        s.stream_type = if service.is_some() {
            StreamType::Debrid
        } else {
            StreamType::P2p
        };
        s.url = service.is_some().then(|| format!("https://cdn/{}", id));
        s.torrent = Some(TorrentInfo {
            info_hash: hash.into(),
            file_idx: None,
            seeders: None,
            sources: vec![],
        });
        s.service = service.map(|(id, cached)| ServiceRef { id, cached });
        s.filename = Some(format!("Movie.2024.1080p-{}.mkv", id));
        s
    }

    fn dedup_config(mode: DedupMode, multi: MultiGroupBehaviour) -> DedupConfig {
        DedupConfig {
            keys: vec![DedupKey::InfoHash, DedupKey::SmartDetect],
            modes: HashMap::new(),
            default_mode: mode,
            multi_group_behaviour: multi,
        }
    }

    #[test]
    fn test_per_service_keeps_one_per_service() {
        let config = config(dedup_config(DedupMode::PerService, MultiGroupBehaviour::KeepAll));
        let streams = vec![
            torrent_stream("s1", "p1", "hash1", Some((ServiceId::RealDebrid, true))),
            torrent_stream("s2", "p2", "hash1", Some((ServiceId::Torbox, false))),
        ];
        let out = Deduplicator::new(&config).apply(streams);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_single_result_aggressive_keeps_cached() {
        let config = config(dedup_config(
            DedupMode::SingleResult,
            MultiGroupBehaviour::Aggressive,
        ));
        let streams = vec![
            torrent_stream("s1", "p1", "hash1", Some((ServiceId::Torbox, false))),
            torrent_stream("s2", "p2", "hash1", Some((ServiceId::RealDebrid, true))),
        ];
        let out = Deduplicator::new(&config).apply(streams);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "s2");
        assert!(out[0].is_cached());
    }

    #[test]
    fn test_single_result_prefers_service_then_addon_order() {
        let config = config(dedup_config(DedupMode::SingleResult, MultiGroupBehaviour::KeepAll));
        let streams = vec![
            torrent_stream("s1", "p2", "hash1", Some((ServiceId::RealDebrid, true))),
            torrent_stream("s2", "p1", "hash1", Some((ServiceId::RealDebrid, true))),
        ];
        let out = Deduplicator::new(&config).apply(streams);
        assert_eq!(out.len(), 1);
        // equal service rank, p1 is ranked above p2
        assert_eq!(out[0].id, "s2");
    }

    #[test]
    fn test_conservative_mixed_cache_states() {
        let config = config(dedup_config(
            DedupMode::Disabled,
            MultiGroupBehaviour::Conservative,
        ));
        // RealDebrid has cached+uncached, Torbox only uncached
        let streams = vec![
            torrent_stream("s1", "p1", "hash1", Some((ServiceId::RealDebrid, true))),
            torrent_stream("s2", "p1", "hash1", Some((ServiceId::RealDebrid, false))),
            torrent_stream("s3", "p2", "hash1", Some((ServiceId::Torbox, false))),
        ];
        let out = Deduplicator::new(&config).apply(streams);
        let ids: Vec<_> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
    }

    #[test]
    fn test_disabled_passes_through() {
        let mut dedup = dedup_config(DedupMode::Disabled, MultiGroupBehaviour::KeepAll);
        dedup.keys = vec![DedupKey::InfoHash];
        let config = config(dedup);
        let streams = vec![
            torrent_stream("s1", "p1", "hash1", None),
            torrent_stream("s2", "p2", "hash1", None),
        ];
        let out = Deduplicator::new(&config).apply(streams);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_idempotent() {
        let config = config(dedup_config(
            DedupMode::SingleResult,
            MultiGroupBehaviour::Aggressive,
        ));
        let streams = vec![
            torrent_stream("s1", "p1", "hash1", Some((ServiceId::Torbox, false))),
            torrent_stream("s2", "p2", "hash1", Some((ServiceId::RealDebrid, true))),
            torrent_stream("s3", "p1", "hash2", None),
        ];
        let deduper = Deduplicator::new(&config);
        let once = deduper.apply(streams);
        let twice = deduper.apply(once.clone());
        let once_ids: Vec<_> = once.iter().map(|s| s.id.as_str()).collect();
        let twice_ids: Vec<_> = twice.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(once_ids, twice_ids);
    }
}
