//! Addon fetcher
//!
//! Resolves one provider's manifest, builds resource URLs and fetches
//! stream responses. Identical in-flight fetches across concurrent
//! requests collapse through the memoizer, so each upstream sees a query
//! at most once per cache window.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{MediaType, ProviderDescriptor, RawStream, Resource};
use crate::services::fetch::{FetchClient, FetchError, FetchOptions};
use crate::services::lock::{LockError, LockOptions, Memoizer};

/// How long a memoized stream response may be replayed.
const STREAM_MEMO_TTL: Duration = Duration::from_secs(30);
/// Manifests change rarely; cache them longer.
const MANIFEST_MEMO_TTL: Duration = Duration::from_secs(600);

/// Per-provider failure. Never fatal to the overall request; the
/// orchestrator converts these into inline error streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderError {
    Timeout,
    Http { status: u16 },
    BadResponse { message: String },
    Network { message: String },
    Recursive,
    Unsupported,
    Lock { message: String },
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Timeout => write!(f, "timed out"),
            ProviderError::Http { status } => write!(f, "upstream returned HTTP {}", status),
            ProviderError::BadResponse { message } => {
                write!(f, "unparseable response: {}", message)
            }
            ProviderError::Network { message } => write!(f, "network error: {}", message),
            ProviderError::Recursive => write!(f, "refused recursive request"),
            ProviderError::Unsupported => write!(f, "resource not supported"),
            ProviderError::Lock { message } => write!(f, "lock error: {}", message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<FetchError> for ProviderError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Timeout { .. } => ProviderError::Timeout,
            FetchError::Status { status, .. } => ProviderError::Http { status },
            FetchError::Recursive { .. } => ProviderError::Recursive,
            FetchError::Network { message, .. } => ProviderError::Network { message },
            FetchError::InvalidUrl { url } => ProviderError::BadResponse {
                message: format!("invalid url {}", url),
            },
        }
    }
}

/// Memoized fetch outcome. Errors are part of the shared payload so every
/// concurrent waiter observes the same failure as the winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum FetchOutcome<T> {
    Ok(T),
    Err(ProviderError),
}

impl<T> FetchOutcome<T> {
    fn into_result(self) -> Result<T, ProviderError> {
        match self {
            FetchOutcome::Ok(v) => Ok(v),
            FetchOutcome::Err(e) => Err(e),
        }
    }
}

/// Addon manifest, parsed tolerantly: `resources` entries are either bare
/// names or full objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub resources: Vec<ManifestResource>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub id_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestResource {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        types: Vec<String>,
        #[serde(default, rename = "idPrefixes")]
        id_prefixes: Option<Vec<String>>,
    },
}

impl ManifestResource {
    pub fn name(&self) -> &str {
        match self {
            ManifestResource::Name(name) => name,
            ManifestResource::Full { name, .. } => name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    streams: Vec<serde_json::Value>,
}

/// A stream query against one provider.
#[derive(Debug, Clone)]
pub struct StreamQuery {
    pub resource: Resource,
    pub media_type: MediaType,
    pub id: String,
    pub extras: Vec<(String, String)>,
}

impl StreamQuery {
    fn extras_slug(&self) -> String {
        self.extras
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Memo key shared across concurrent identical upstream fetches.
    fn memo_key(&self, manifest_url: &str) -> String {
        format!(
            "addon:{}:{}:{}:{}:{}",
            manifest_url,
            self.resource,
            self.media_type,
            self.id,
            self.extras_slug()
        )
    }
}

/// Build the resource URL from the manifest base.
pub fn resource_url(manifest_url: &str, query: &StreamQuery) -> String {
    let base = manifest_url
        .trim_end_matches("/manifest.json")
        .trim_end_matches('/');
    let slug = query.extras_slug();
    if slug.is_empty() {
        format!("{}/{}/{}/{}.json", base, query.resource, query.media_type, query.id)
    } else {
        format!(
            "{}/{}/{}/{}/{}.json",
            base, query.resource, query.media_type, query.id, slug
        )
    }
}

pub struct AddonFetcher {
    fetch: Arc<FetchClient>,
    memoizer: Arc<Memoizer>,
}

impl AddonFetcher {
    pub fn new(fetch: Arc<FetchClient>, memoizer: Arc<Memoizer>) -> Self {
        Self { fetch, memoizer }
    }

    /// Fetch and parse a provider's manifest.
    pub async fn fetch_manifest(
        &self,
        provider: &ProviderDescriptor,
    ) -> Result<Manifest, ProviderError> {
        let key = format!("manifest:{}", provider.manifest_url);
        let fetch = self.fetch.clone();
        let url = provider.manifest_url.clone();
        let options = self.fetch_options(provider);

        let outcome = self
            .memoizer
            .with_lock(
                &key,
                || async move {
                    let result: FetchOutcome<Manifest> =
                        match fetch.fetch_text(&url, options).await {
                            Ok(body) => match serde_json::from_str(&body) {
                                Ok(manifest) => FetchOutcome::Ok(manifest),
                                Err(e) => FetchOutcome::Err(ProviderError::BadResponse {
                                    message: e.to_string(),
                                }),
                            },
                            Err(e) => FetchOutcome::Err(e.into()),
                        };
                    Ok::<_, anyhow::Error>(result)
                },
                LockOptions {
                    ttl: MANIFEST_MEMO_TTL,
                    timeout: Duration::from_millis(provider.timeout_ms) + Duration::from_secs(2),
                    ..Default::default()
                },
            )
            .await
            .map_err(lock_error)?;

        outcome.result.into_result()
    }

    /// Fetch the raw stream collection for a query. Same-keyed concurrent
    /// fetches collapse into one upstream call.
    pub async fn fetch_streams(
        &self,
        provider: &ProviderDescriptor,
        query: &StreamQuery,
    ) -> Result<Vec<RawStream>, ProviderError> {
        if !provider.supports(query.resource, query.media_type) {
            return Err(ProviderError::Unsupported);
        }

        let key = query.memo_key(&provider.manifest_url);
        let url = resource_url(&provider.manifest_url, query);
        let fetch = self.fetch.clone();
        let options = self.fetch_options(provider);
        let display_name = provider.display_name.clone();

        let outcome = self
            .memoizer
            .with_lock(
                &key,
                || async move {
                    let result: FetchOutcome<Vec<RawStream>> =
                        match fetch.fetch_text(&url, options).await {
                            Ok(body) => parse_stream_body(&display_name, &body),
                            Err(e) => FetchOutcome::Err(e.into()),
                        };
                    Ok::<_, anyhow::Error>(result)
                },
                LockOptions {
                    ttl: STREAM_MEMO_TTL,
                    timeout: Duration::from_millis(provider.timeout_ms) + Duration::from_secs(2),
                    ..Default::default()
                },
            )
            .await
            .map_err(lock_error)?;

        if outcome.cached {
            debug!("stream fetch for {} served from memoizer", provider.display_name);
        }
        outcome.result.into_result()
    }

    fn fetch_options(&self, provider: &ProviderDescriptor) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(provider.timeout_ms),
            headers: provider
                .extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        }
    }
}

fn lock_error(e: LockError) -> ProviderError {
    match e {
        LockError::Timeout => ProviderError::Timeout,
        other => ProviderError::Lock {
            message: other.to_string(),
        },
    }
}

/// Parse a stream response body. The top-level shape must match; single
/// malformed entries are skipped with a warning rather than failing the
/// whole provider.
fn parse_stream_body(provider_name: &str, body: &str) -> FetchOutcome<Vec<RawStream>> {
    let response: StreamResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            return FetchOutcome::Err(ProviderError::BadResponse {
                message: e.to_string(),
            })
        }
    };
    let mut streams = Vec::with_capacity(response.streams.len());
    for value in response.streams {
        match serde_json::from_value::<RawStream>(value) {
            Ok(stream) => streams.push(stream),
            Err(e) => warn!("{}: skipping malformed stream entry: {}", provider_name, e),
        }
    }
    FetchOutcome::Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> StreamQuery {
        StreamQuery {
            resource: Resource::Stream,
            media_type: MediaType::Series,
            id: "tt0903747:3:5".into(),
            extras: vec![],
        }
    }

    #[test]
    fn test_resource_url() {
        assert_eq!(
            resource_url("https://addon.example.com/manifest.json", &query()),
            "https://addon.example.com/stream/series/tt0903747:3:5.json"
        );
        let mut with_extras = query();
        with_extras.extras = vec![("skip".into(), "100".into())];
        assert_eq!(
            resource_url("https://addon.example.com/manifest.json", &with_extras),
            "https://addon.example.com/stream/series/tt0903747:3:5/skip=100.json"
        );
    }

    #[test]
    fn test_memo_key_includes_all_parts() {
        let a = query().memo_key("https://a/manifest.json");
        let mut other = query();
        other.id = "tt0903747:3:6".into();
        let b = other.memo_key("https://a/manifest.json");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_stream_body_tolerates_bad_entries() {
        let body = r#"{"streams":[{"name":"ok","url":"http://x/a.mkv"},{"url":12345}]}"#;
        match parse_stream_body("test", body) {
            FetchOutcome::Ok(streams) => {
                assert_eq!(streams.len(), 1);
                assert_eq!(streams[0].name.as_deref(), Some("ok"));
            }
            FetchOutcome::Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_parse_stream_body_rejects_unknown_shape() {
        assert!(matches!(
            parse_stream_body("test", "[1,2,3]"),
            FetchOutcome::Err(ProviderError::BadResponse { .. })
        ));
    }

    #[test]
    fn test_manifest_resource_forms() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "id": "org.example",
                "name": "Example",
                "resources": ["stream", {"name": "meta", "types": ["movie"]}],
                "types": ["movie", "series"]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.resources.len(), 2);
        assert_eq!(manifest.resources[0].name(), "stream");
        assert_eq!(manifest.resources[1].name(), "meta");
    }
}
