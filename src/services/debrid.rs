//! Debrid playback resolver
//!
//! Issues final playable URLs for downloadable content at click time:
//! check instant availability, create the job if needed, pick the file
//! matching the requested title/episode, and unrestrict it. Uncached
//! content either waits for the cache (cache-and-play) or redirects the
//! player to the downloading placeholder. Concurrent resolves for the
//! same `(service, hash, index)` share one flight through the memoizer,
//! and per-service concurrency is bounded to respect provider limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::models::{FileInfo, ServiceId, TitleMetadata};
use crate::services::lock::{LockError, LockOptions, Memoizer};
use crate::services::parser::{is_video_filename, TitleParser};

/// Stable error codes, each mapping to a pre-rendered placeholder video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebridErrorCode {
    Unauthorized,
    Forbidden,
    PaymentRequired,
    StoreLimitExceeded,
    UnprocessableEntity,
    StoreMagnetInvalid,
    UnavailableForLegalReasons,
    NoMatchingFile,
}

impl DebridErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebridErrorCode::Unauthorized => "UNAUTHORIZED",
            DebridErrorCode::Forbidden => "FORBIDDEN",
            DebridErrorCode::PaymentRequired => "PAYMENT_REQUIRED",
            DebridErrorCode::StoreLimitExceeded => "STORE_LIMIT_EXCEEDED",
            DebridErrorCode::UnprocessableEntity => "UNPROCESSABLE_ENTITY",
            DebridErrorCode::StoreMagnetInvalid => "STORE_MAGNET_INVALID",
            DebridErrorCode::UnavailableForLegalReasons => "UNAVAILABLE_FOR_LEGAL_REASONS",
            DebridErrorCode::NoMatchingFile => "NO_MATCHING_FILE",
        }
    }

    /// Static placeholder video served to the player for this failure.
    pub fn placeholder_path(&self) -> String {
        format!("/static/errors/{}.mp4", self.as_str().to_lowercase())
    }

    /// Map an upstream HTTP status onto a stable code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => DebridErrorCode::Unauthorized,
            402 => DebridErrorCode::PaymentRequired,
            403 => DebridErrorCode::Forbidden,
            422 => DebridErrorCode::UnprocessableEntity,
            451 => DebridErrorCode::UnavailableForLegalReasons,
            507 => DebridErrorCode::StoreLimitExceeded,
            _ => DebridErrorCode::UnprocessableEntity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebridError {
    pub code: DebridErrorCode,
    pub message: String,
}

impl DebridError {
    pub fn new(code: DebridErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DebridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for DebridError {}

/// One file inside a service job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebridFile {
    pub index: u32,
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
}

/// A magnet/NZB job on a debrid service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebridJob {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub files: Vec<DebridFile>,
}

/// Object-safe async interface one service adapter implements. Concrete
/// HTTP bindings live outside the core.
pub trait DebridClient: Send + Sync {
    fn id(&self) -> ServiceId;

    /// Instant-availability check for a set of content hashes.
    fn check_cached<'a>(
        &'a self,
        credential: &'a str,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<HashMap<String, bool>, DebridError>>;

    /// Create (or re-use) the job for this content.
    fn add_job<'a>(
        &'a self,
        credential: &'a str,
        info: &'a FileInfo,
    ) -> BoxFuture<'a, Result<DebridJob, DebridError>>;

    /// Current job state for a hash, if one exists.
    fn get_job<'a>(
        &'a self,
        credential: &'a str,
        hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<DebridJob>, DebridError>>;

    /// Produce an unrestricted, directly playable URL for one file.
    fn unrestrict<'a>(
        &'a self,
        credential: &'a str,
        job: &'a DebridJob,
        file: &'a DebridFile,
    ) -> BoxFuture<'a, Result<String, DebridError>>;
}

/// Resolution outcome handed back to the playback route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// 307 to the final URL.
    Ready { url: String },
    /// 302 to the downloading placeholder; the player retries.
    Downloading,
}

/// Tunables for the wait-for-cache loop.
#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub per_service_concurrency: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            per_service_concurrency: 4,
        }
    }
}

pub struct PlaybackResolver {
    clients: HashMap<ServiceId, Arc<dyn DebridClient>>,
    semaphores: HashMap<ServiceId, Arc<Semaphore>>,
    memoizer: Arc<Memoizer>,
    options: ResolverOptions,
}

impl PlaybackResolver {
    pub fn new(
        clients: Vec<Arc<dyn DebridClient>>,
        memoizer: Arc<Memoizer>,
        options: ResolverOptions,
    ) -> Self {
        let mut map = HashMap::new();
        let mut semaphores = HashMap::new();
        for client in clients {
            semaphores.insert(
                client.id(),
                Arc::new(Semaphore::new(options.per_service_concurrency)),
            );
            map.insert(client.id(), client);
        }
        Self {
            clients: map,
            semaphores,
            memoizer,
            options,
        }
    }

    /// Resolve one playback request. Identical concurrent resolves share a
    /// single upstream flight.
    pub async fn resolve(
        &self,
        service: ServiceId,
        credential: &str,
        info: &FileInfo,
        metadata: &TitleMetadata,
    ) -> Result<Resolution, DebridError> {
        let client = self.clients.get(&service).ok_or_else(|| {
            DebridError::new(
                DebridErrorCode::UnprocessableEntity,
                format!("service {} has no adapter", service),
            )
        })?;

        let key = format!(
            "debrid:{}:{}:{}",
            service,
            info.hash.to_lowercase(),
            info.index.map(|i| i.to_string()).unwrap_or_default()
        );

        let semaphore = self.semaphores.get(&service).cloned();
        let outcome = self
            .memoizer
            .with_lock(
                &key,
                || async {
                    let _permit = match &semaphore {
                        Some(s) => Some(s.acquire().await.map_err(|e| anyhow::anyhow!(e))?),
                        None => None,
                    };
                    match self.resolve_inner(client.as_ref(), credential, info, metadata).await {
                        Ok(resolution) => Ok(ResolveOutcome::Ok(resolution)),
                        Err(e) => Ok(ResolveOutcome::Err(e)),
                    }
                },
                LockOptions {
                    ttl: Duration::from_secs(120),
                    timeout: self.options.wait_timeout + Duration::from_secs(30),
                    retry_interval: Duration::from_millis(250),
                },
            )
            .await
            .map_err(|e| match e {
                LockError::Timeout => DebridError::new(
                    DebridErrorCode::UnprocessableEntity,
                    "timed out waiting for a concurrent resolve",
                ),
                other => DebridError::new(DebridErrorCode::UnprocessableEntity, other.to_string()),
            })?;

        if outcome.cached {
            debug!("debrid resolve for {} replayed from memoizer", key);
        }
        match outcome.result {
            ResolveOutcome::Ok(resolution) => Ok(resolution),
            ResolveOutcome::Err(e) => Err(e),
        }
    }

    /// CHECK → ADD → (WAIT) → PICK_FILE → RESOLVE.
    async fn resolve_inner(
        &self,
        client: &dyn DebridClient,
        credential: &str,
        info: &FileInfo,
        metadata: &TitleMetadata,
    ) -> Result<Resolution, DebridError> {
        let hash = info.hash.to_lowercase();
        let hashes = vec![hash.clone()];
        let availability = client.check_cached(credential, &hashes).await?;
        let cached = availability.get(&hash).copied().unwrap_or(false);

        let job = if cached {
            client.add_job(credential, info).await?
        } else {
            let job = client.add_job(credential, info).await?;
            if job.status != JobStatus::Completed {
                if info.cache_and_play.unwrap_or(false) {
                    match self.wait_for_completion(client, credential, &hash).await? {
                        Some(job) => job,
                        None => return Ok(Resolution::Downloading),
                    }
                } else {
                    return Ok(Resolution::Downloading);
                }
            } else {
                job
            }
        };

        let file = pick_file(&job, info, metadata)?;
        let url = client.unrestrict(credential, &job, &file).await?;
        Ok(Resolution::Ready { url })
    }

    async fn wait_for_completion(
        &self,
        client: &dyn DebridClient,
        credential: &str,
        hash: &str,
    ) -> Result<Option<DebridJob>, DebridError> {
        let deadline = tokio::time::Instant::now() + self.options.wait_timeout;
        loop {
            tokio::time::sleep(self.options.poll_interval).await;
            match client.get_job(credential, hash).await? {
                Some(job) if job.status == JobStatus::Completed => return Ok(Some(job)),
                Some(_) | None => {}
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("cache-and-play wait for {} timed out", hash);
                return Ok(None);
            }
        }
    }
}

/// Memoized payload: errors replay to concurrent waiters too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ResolveOutcome {
    Ok(Resolution),
    Err(DebridError),
}

fn normalize_title(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Partial-ratio similarity over normalized strings: 1.0 when one contains
/// the other, otherwise the longest common substring over the shorter
/// length.
fn partial_ratio(a: &str, b: &str) -> f64 {
    let a = normalize_title(a);
    let b = normalize_title(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if long.contains(short.as_str()) {
        return 1.0;
    }
    let short_bytes = short.as_bytes();
    let long_bytes = long.as_bytes();
    let mut best = 0usize;
    let mut previous = vec![0usize; long_bytes.len() + 1];
    for i in 1..=short_bytes.len() {
        let mut current = vec![0usize; long_bytes.len() + 1];
        for j in 1..=long_bytes.len() {
            if short_bytes[i - 1] == long_bytes[j - 1] {
                current[j] = previous[j - 1] + 1;
                best = best.max(current[j]);
            }
        }
        previous = current;
    }
    best as f64 / short.len() as f64
}

/// Score every file in the job and pick the best match for the request.
/// Ties break toward the earliest index; a winner whose episode does not
/// match the request is rejected.
pub fn pick_file(
    job: &DebridJob,
    info: &FileInfo,
    metadata: &TitleMetadata,
) -> Result<DebridFile, DebridError> {
    if job.files.is_empty() {
        return Err(DebridError::new(
            DebridErrorCode::NoMatchingFile,
            "job has no files",
        ));
    }
    let max_size = job.files.iter().map(|f| f.size).max().unwrap_or(0).max(1);

    let mut best: Option<(f64, &DebridFile)> = None;
    for file in &job.files {
        let mut score = 0.0;

        let is_video = is_video_filename(&file.name)
            || file
                .mime
                .as_deref()
                .map(|m| m.starts_with("video/"))
                .unwrap_or(false);
        if is_video {
            score += 1000.0;
        }

        let parsed = TitleParser::parse(&file.name);
        if let Some(parsed) = &parsed {
            if let (Some(season), Some(episode)) = (metadata.season, metadata.episode) {
                if parsed.season == Some(season) && parsed.episode == Some(episode) {
                    score += 500.0;
                }
            }
            if let Some(year) = metadata.year {
                if parsed.year == Some(year) {
                    score += 500.0;
                }
            }
        }

        let title_matches = metadata
            .titles
            .iter()
            .any(|title| partial_ratio(title, &file.name) >= 0.8);
        if title_matches {
            score += 100.0;
        }

        score += (file.size as f64 / max_size as f64) * 50.0;

        if info.index == Some(file.index) {
            score += 25.0;
        }
        if let Some(filename) = &info.filename {
            if normalize_title(&job.name).contains(&normalize_title(filename)) {
                score += 25.0;
            }
        }

        let better = match &best {
            None => true,
            Some((best_score, best_file)) => {
                score > *best_score || (score == *best_score && file.index < best_file.index)
            }
        };
        if better {
            best = Some((score, file));
        }
    }

    let (_, winner) = best.expect("job.files is non-empty");

    // Reject a winner that is recognisably the wrong episode.
    if let (Some(episode), Some(parsed)) = (metadata.episode, TitleParser::parse(&winner.name)) {
        if let Some(file_episode) = parsed.episode {
            if file_episode != episode {
                return Err(DebridError::new(
                    DebridErrorCode::NoMatchingFile,
                    format!(
                        "best file '{}' is episode {} but episode {} was requested",
                        winner.name, file_episode, episode
                    ),
                ));
            }
        }
    }

    Ok(winner.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn file(index: u32, name: &str, size: u64) -> DebridFile {
        DebridFile {
            index,
            name: name.into(),
            size,
            mime: None,
        }
    }

    fn metadata() -> TitleMetadata {
        TitleMetadata {
            titles: vec!["The Expanse".into()],
            year: None,
            season: Some(3),
            episode: Some(5),
            absolute_episode: None,
        }
    }

    fn info(hash: &str, cache_and_play: bool) -> FileInfo {
        FileInfo {
            kind: "torrent".into(),
            hash: hash.into(),
            index: None,
            sources: vec![],
            nzb: None,
            cache_and_play: Some(cache_and_play),
            filename: None,
        }
    }

    #[test]
    fn test_pick_file_prefers_matching_episode() {
        let job = DebridJob {
            id: "j1".into(),
            name: "The.Expanse.S03.1080p".into(),
            status: JobStatus::Completed,
            files: vec![
                file(0, "The.Expanse.S03E04.1080p.mkv", 900),
                file(1, "The.Expanse.S03E05.1080p.mkv", 900),
                file(2, "sample.mkv", 10),
                file(3, "info.nfo", 1),
            ],
        };
        let picked = pick_file(&job, &info("h", false), &metadata()).unwrap();
        assert_eq!(picked.index, 1);
    }

    #[test]
    fn test_pick_file_rejects_wrong_episode_winner() {
        let job = DebridJob {
            id: "j1".into(),
            name: "The.Expanse.S03".into(),
            status: JobStatus::Completed,
            files: vec![file(0, "The.Expanse.S03E04.1080p.mkv", 900)],
        };
        let err = pick_file(&job, &info("h", false), &metadata()).unwrap_err();
        assert_eq!(err.code, DebridErrorCode::NoMatchingFile);
    }

    #[test]
    fn test_pick_file_ties_break_by_index() {
        let job = DebridJob {
            id: "j1".into(),
            name: "movie".into(),
            status: JobStatus::Completed,
            files: vec![file(7, "a.mkv", 500), file(3, "b.mkv", 500)],
        };
        let empty = TitleMetadata::default();
        let picked = pick_file(&job, &info("h", false), &empty).unwrap();
        assert_eq!(picked.index, 3);
    }

    #[test]
    fn test_partial_ratio() {
        assert!(partial_ratio("The Expanse", "The.Expanse.S03E05.1080p.mkv") >= 0.8);
        assert!(partial_ratio("Some Other Show", "The.Expanse.S03E05.mkv") < 0.8);
    }

    // ============ Resolver flow tests ============

    struct MockClient {
        cached: bool,
        complete_after_polls: usize,
        polls: AtomicUsize,
        adds: AtomicUsize,
    }

    impl MockClient {
        fn new(cached: bool, complete_after_polls: usize) -> Self {
            Self {
                cached,
                complete_after_polls,
                polls: AtomicUsize::new(0),
                adds: AtomicUsize::new(0),
            }
        }

        fn job(&self, status: JobStatus) -> DebridJob {
            DebridJob {
                id: "j1".into(),
                name: "The.Expanse.S03".into(),
                status,
                files: vec![DebridFile {
                    index: 0,
                    name: "The.Expanse.S03E05.1080p.mkv".into(),
                    size: 900,
                    mime: None,
                }],
            }
        }
    }

    impl DebridClient for MockClient {
        fn id(&self) -> ServiceId {
            ServiceId::RealDebrid
        }

        fn check_cached<'a>(
            &'a self,
            _credential: &'a str,
            hashes: &'a [String],
        ) -> BoxFuture<'a, Result<HashMap<String, bool>, DebridError>> {
            Box::pin(async move {
                Ok(hashes.iter().map(|h| (h.clone(), self.cached)).collect())
            })
        }

        fn add_job<'a>(
            &'a self,
            _credential: &'a str,
            _info: &'a FileInfo,
        ) -> BoxFuture<'a, Result<DebridJob, DebridError>> {
            Box::pin(async move {
                self.adds.fetch_add(1, Ordering::SeqCst);
                let status = if self.cached {
                    JobStatus::Completed
                } else {
                    JobStatus::Downloading
                };
                Ok(self.job(status))
            })
        }

        fn get_job<'a>(
            &'a self,
            _credential: &'a str,
            _hash: &'a str,
        ) -> BoxFuture<'a, Result<Option<DebridJob>, DebridError>> {
            Box::pin(async move {
                let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
                let status = if polls >= self.complete_after_polls {
                    JobStatus::Completed
                } else {
                    JobStatus::Downloading
                };
                Ok(Some(self.job(status)))
            })
        }

        fn unrestrict<'a>(
            &'a self,
            _credential: &'a str,
            _job: &'a DebridJob,
            file: &'a DebridFile,
        ) -> BoxFuture<'a, Result<String, DebridError>> {
            Box::pin(async move { Ok(format!("https://cdn.example.com/{}", file.name)) })
        }
    }

    fn resolver(client: Arc<dyn DebridClient>) -> PlaybackResolver {
        PlaybackResolver::new(
            vec![client],
            Arc::new(Memoizer::local()),
            ResolverOptions {
                wait_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
                per_service_concurrency: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_cached_resolves_to_url() {
        let resolver = resolver(Arc::new(MockClient::new(true, 0)));
        let result = resolver
            .resolve(ServiceId::RealDebrid, "key", &info("HASH", false), &metadata())
            .await
            .unwrap();
        assert_eq!(
            result,
            Resolution::Ready {
                url: "https://cdn.example.com/The.Expanse.S03E05.1080p.mkv".into()
            }
        );
    }

    #[tokio::test]
    async fn test_uncached_without_cache_and_play_downloads() {
        let resolver = resolver(Arc::new(MockClient::new(false, usize::MAX)));
        let result = resolver
            .resolve(ServiceId::RealDebrid, "key", &info("hash", false), &metadata())
            .await
            .unwrap();
        assert_eq!(result, Resolution::Downloading);
    }

    #[tokio::test]
    async fn test_uncached_with_cache_and_play_waits() {
        let resolver = resolver(Arc::new(MockClient::new(false, 3)));
        let result = resolver
            .resolve(ServiceId::RealDebrid, "key", &info("hash", true), &metadata())
            .await
            .unwrap();
        assert!(matches!(result, Resolution::Ready { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_flight() {
        let client = Arc::new(MockClient::new(true, 0));
        let resolver = Arc::new(resolver(client.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(ServiceId::RealDebrid, "key", &info("hash", false), &metadata())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Resolution::Ready { .. }));
        }
        assert_eq!(client.adds.load(Ordering::SeqCst), 1);
    }
}
