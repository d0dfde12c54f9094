//! Outbound HTTP fetch layer
//!
//! All upstream traffic goes through here: internal-URL rewriting,
//! per-host proxy selection, a recursion guard, User-Agent overrides,
//! IP forwarding and bounded retries with exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::{Client, Method, Response, Url};
use tracing::{debug, warn};

use crate::config::{Config, ProxyRule};

/// Fetch failure kinds. Rate-limit responses surface as `Status` and are
/// never retried.
#[derive(Debug)]
pub enum FetchError {
    Timeout { url: String, after: Duration },
    Recursive { url: String },
    Status { url: String, status: u16 },
    Network { url: String, message: String },
    InvalidUrl { url: String },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Timeout { url, after } => {
                write!(f, "request to {} timed out after {:?}", url, after)
            }
            FetchError::Recursive { url } => {
                write!(f, "possible recursive request to {}", url)
            }
            FetchError::Status { url, status } => {
                write!(f, "request to {} failed with status {}", url, status)
            }
            FetchError::Network { url, message } => {
                write!(f, "request to {} failed: {}", url, message)
            }
            FetchError::InvalidUrl { url } => write!(f, "invalid url: {}", url),
        }
    }
}

impl std::error::Error for FetchError {}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Client IP forwarded upstream via X-Forwarded-For / X-Real-IP.
    pub forward_ip: Option<String>,
    pub ignore_recursion: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            timeout: Duration::from_secs(15),
            headers: Vec::new(),
            body: None,
            forward_ip: None,
            ignore_recursion: false,
        }
    }
}

/// Match a hostname glob: `*` matches everything, `*.suffix` matches by
/// suffix, anything else matches exactly.
fn glob_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{}", suffix));
    }
    pattern == host
}

/// The shared outbound HTTP client.
pub struct FetchClient {
    direct: Client,
    proxied: Vec<Client>,
    config: Arc<Config>,
    recursion: Mutex<HashMap<String, Vec<Instant>>>,
}

impl FetchClient {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let direct = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        let mut proxied = Vec::with_capacity(config.addon_proxies.len());
        for proxy_url in &config.addon_proxies {
            let client = Client::builder()
                .redirect(reqwest::redirect::Policy::limited(10))
                .proxy(reqwest::Proxy::all(proxy_url)?)
                .build()?;
            proxied.push(client);
        }

        Ok(Self {
            direct,
            proxied,
            config,
            recursion: Mutex::new(HashMap::new()),
        })
    }

    /// Rewrite requests aimed at our own public base URL onto the internal
    /// base URL, then apply operator URL mappings.
    fn rewrite_url(&self, url: &str) -> String {
        let mut rewritten = url.to_string();
        if let Some(internal) = &self.config.internal_url {
            if let Some(rest) = rewritten
                .strip_prefix(self.config.base_url.trim_end_matches('/'))
            {
                rewritten = format!("{}{}", internal.trim_end_matches('/'), rest);
            }
        }
        for (from, to) in &self.config.request_url_mappings {
            if let Some(rest) = rewritten.strip_prefix(from.as_str()) {
                rewritten = format!("{}{}", to, rest);
                break;
            }
        }
        rewritten
    }

    /// Select the outbound client for a host. The last matching rule wins.
    fn client_for(&self, host: &str) -> &Client {
        let mut selected: Option<ProxyRule> = None;
        for (pattern, rule) in &self.config.addon_proxy_config {
            if glob_matches(pattern, host) {
                selected = Some(*rule);
            }
        }
        match selected {
            Some(ProxyRule::Never) | None => &self.direct,
            Some(ProxyRule::Always) => self.proxied.first().unwrap_or_else(|| {
                warn!("proxy requested for {} but no ADDON_PROXY configured", host);
                &self.direct
            }),
            Some(ProxyRule::Index(i)) => self.proxied.get(i).unwrap_or_else(|| {
                warn!("proxy index {} for {} is out of range", i, host);
                &self.direct
            }),
        }
    }

    /// Count recent calls per `(url, forward_ip)`; above the threshold the
    /// call is refused as a probable recursion.
    fn check_recursion(&self, url: &str, forward_ip: Option<&str>) -> Result<(), FetchError> {
        let key = format!("{}|{}", url, forward_ip.unwrap_or(""));
        let window = Duration::from_secs(self.config.recursion_threshold_window_secs);
        let now = Instant::now();

        let mut guard = self.recursion.lock().unwrap();
        let entries = guard.entry(key).or_default();
        entries.retain(|t| now.duration_since(*t) < window);
        if entries.len() >= self.config.recursion_threshold_limit as usize {
            return Err(FetchError::Recursive { url: url.into() });
        }
        entries.push(now);
        Ok(())
    }

    /// Issue a request. Transient network errors are retried with
    /// exponential backoff; HTTP error statuses and rate limits are not.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<Response, FetchError> {
        let target = self.rewrite_url(url);
        let parsed = Url::parse(&target).map_err(|_| FetchError::InvalidUrl {
            url: target.clone(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        if !options.ignore_recursion {
            self.check_recursion(&target, options.forward_ip.as_deref())?;
        }

        let client = self.client_for(&host);
        let user_agent = self
            .config
            .hostname_user_agent_overrides
            .get(&host)
            .cloned()
            .unwrap_or_else(|| self.config.user_agent.clone());

        let deadline = Instant::now() + options.timeout;
        let mut attempt: u32 = 0;

        loop {
            let mut request = client
                .request(options.method.clone(), parsed.clone())
                .header(reqwest::header::USER_AGENT, &user_agent);

            for (name, value) in &options.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(ip) = &options.forward_ip {
                request = request
                    .header("X-Forwarded-For", ip.as_str())
                    .header("X-Real-IP", ip.as_str());
            }
            if let (Some(internal), Some(secret)) =
                (&self.config.internal_url, &self.config.internal_secret)
            {
                if target.starts_with(internal.trim_end_matches('/')) {
                    request = request.header("X-Internal-Secret", secret.as_str());
                }
            }
            if let Some(body) = &options.body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FetchError::Timeout {
                    url: target,
                    after: options.timeout,
                });
            }

            match tokio::time::timeout(remaining, request.send()).await {
                Err(_) => {
                    return Err(FetchError::Timeout {
                        url: target,
                        after: options.timeout,
                    })
                }
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        return Ok(response);
                    }
                    // 429 and other error statuses surface immediately.
                    return Err(FetchError::Status {
                        url: target,
                        status: status.as_u16(),
                    });
                }
                Ok(Err(e)) => {
                    let transient = e.is_connect() || e.is_request() && !e.is_body();
                    if transient && attempt < self.config.max_fetch_retries {
                        let backoff = Duration::from_millis(250 * 2u64.pow(attempt));
                        if Instant::now() + backoff < deadline {
                            debug!(
                                "retrying {} after transient error (attempt {}): {}",
                                target, attempt, e
                            );
                            tokio::time::sleep(backoff).await;
                            attempt += 1;
                            continue;
                        }
                    }
                    return Err(if e.is_timeout() {
                        FetchError::Timeout {
                            url: target,
                            after: options.timeout,
                        }
                    } else {
                        FetchError::Network {
                            url: target,
                            message: e.to_string(),
                        }
                    });
                }
            }
        }
    }

    /// Fetch and return the body text.
    pub async fn fetch_text(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<String, FetchError> {
        let url_owned = url.to_string();
        let response = self.fetch(url, options).await?;
        response.text().await.map_err(|e| FetchError::Network {
            url: url_owned,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("*", "anything.example.com"));
        assert!(glob_matches("*.example.com", "api.example.com"));
        assert!(glob_matches("*.example.com", "example.com"));
        assert!(!glob_matches("*.example.com", "example.org"));
        assert!(glob_matches("exact.host", "exact.host"));
        assert!(!glob_matches("exact.host", "other.host"));
    }

    fn client_with(config: Config) -> FetchClient {
        FetchClient::new(Arc::new(config)).unwrap()
    }

    fn base_config() -> Config {
        // from_env with no relevant vars set gives defaults
        Config::from_env()
    }

    #[test]
    fn test_rewrite_to_internal() {
        let mut config = base_config();
        config.base_url = "https://public.example.com".into();
        config.internal_url = Some("http://internal:3001".into());
        let client = client_with(config);
        assert_eq!(
            client.rewrite_url("https://public.example.com/stream/movie/tt1.json"),
            "http://internal:3001/stream/movie/tt1.json"
        );
        assert_eq!(
            client.rewrite_url("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_recursion_guard_trips() {
        let mut config = base_config();
        config.recursion_threshold_limit = 3;
        config.recursion_threshold_window_secs = 60;
        let client = client_with(config);
        for _ in 0..3 {
            client.check_recursion("http://x/y", Some("1.2.3.4")).unwrap();
        }
        assert!(matches!(
            client.check_recursion("http://x/y", Some("1.2.3.4")),
            Err(FetchError::Recursive { .. })
        ));
        // a different forward ip is a different key
        client.check_recursion("http://x/y", Some("5.6.7.8")).unwrap();
    }
}
