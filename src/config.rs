use std::collections::HashMap;
use std::env;

use crate::models::config::ConfigLimits;
use crate::models::provider::ServiceId;

/// Per-host outbound proxy rule. `Index` selects an entry from
/// `addon_proxies`; `Always`/`Never` force or bypass proxying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyRule {
    Index(usize),
    Always,
    Never,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    /// Public front-door URL of this deployment.
    pub base_url: String,
    /// Internal URL requests to `base_url` are rewritten onto, so that
    /// self-referencing fetches skip the external front door.
    pub internal_url: Option<String>,
    pub internal_secret: Option<String>,

    // Storage backends
    /// Enables the broadcast memoizer backend when set.
    pub redis_uri: Option<String>,
    /// Enables the transactional memoizer backend and persisted tables.
    pub database_uri: Option<String>,
    pub db_max_connections: u32,

    // Outbound fetch
    /// Outbound HTTP/SOCKS5 proxies, indexable from `addon_proxy_config`.
    pub addon_proxies: Vec<String>,
    /// Hostname-glob → proxy rule table; last matching rule wins.
    pub addon_proxy_config: Vec<(String, ProxyRule)>,
    /// Domain → User-Agent overrides.
    pub hostname_user_agent_overrides: HashMap<String, String>,
    /// URL prefix rewrites applied before dispatch.
    pub request_url_mappings: Vec<(String, String)>,
    pub recursion_threshold_limit: u32,
    pub recursion_threshold_window_secs: u64,
    pub max_fetch_retries: u32,
    /// Bound on concurrent provider fetches per request.
    pub fetch_parallelism: usize,
    /// Bound on concurrent debrid operations per service.
    pub debrid_parallelism: usize,

    // User config limits
    pub max_stream_expression_filters: usize,
    pub max_keyword_filters: usize,
    pub max_groups: usize,
    /// Exact-string allow-list for untrusted users' regex filters.
    pub regex_allow_list: Vec<String>,

    // Playback
    pub playback_link_validity_secs: u64,

    // Pruning
    pub prune_max_days: i64,
    pub prune_interval_secs: u64,

    // Operator proxy overrides (always win over user values)
    pub force_proxy_enabled: Option<bool>,
    pub force_proxy_url: Option<String>,
    pub force_proxy_public_url: Option<String>,
    pub force_proxy_credentials: Option<String>,

    // Operator service credentials
    /// Used when the user has not supplied a key for the service.
    pub default_service_api_keys: HashMap<ServiceId, String>,
    /// Always override the user's key for the service.
    pub forced_service_api_keys: HashMap<ServiceId, String>,

    // Misc
    pub user_agent: String,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `key=value` pairs separated by commas.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_proxy_rule(raw: &str) -> Option<ProxyRule> {
    match raw {
        "true" => Some(ProxyRule::Always),
        "false" => Some(ProxyRule::Never),
        other => other.parse().ok().map(ProxyRule::Index),
    }
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3001".to_string());

        let addon_proxies: Vec<String> = env::var("ADDON_PROXY")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let addon_proxy_config: Vec<(String, ProxyRule)> = env::var("ADDON_PROXY_CONFIG")
            .map(|v| {
                parse_pairs(&v)
                    .into_iter()
                    .filter_map(|(glob, rule)| Some((glob, parse_proxy_rule(&rule)?)))
                    .collect()
            })
            .unwrap_or_default();

        let mut default_service_api_keys = HashMap::new();
        let mut forced_service_api_keys = HashMap::new();
        for service in ServiceId::ALL {
            let upper = service.as_str().to_uppercase();
            if let Ok(key) = env::var(format!("DEFAULT_{}_API_KEY", upper)) {
                default_service_api_keys.insert(service, key);
            }
            if let Ok(key) = env::var(format!("FORCED_{}_API_KEY", upper)) {
                forced_service_api_keys.insert(service, key);
            }
        }

        Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .unwrap_or(3001),
            base_url,
            internal_url: env::var("INTERNAL_URL").ok(),
            internal_secret: env::var("INTERNAL_SECRET").ok(),

            redis_uri: env::var("REDIS_URI").ok(),
            database_uri: env::var("DATABASE_URI").ok(),
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),

            addon_proxies,
            addon_proxy_config,
            hostname_user_agent_overrides: env::var("HOSTNAME_USER_AGENT_OVERRIDES")
                .map(|v| parse_pairs(&v).into_iter().collect())
                .unwrap_or_default(),
            request_url_mappings: env::var("REQUEST_URL_MAPPINGS")
                .map(|v| parse_pairs(&v))
                .unwrap_or_default(),
            recursion_threshold_limit: env_u64("RECURSION_THRESHOLD_LIMIT", 5) as u32,
            recursion_threshold_window_secs: env_u64("RECURSION_THRESHOLD_WINDOW", 10),
            max_fetch_retries: env_u64("MAX_FETCH_RETRIES", 2) as u32,
            fetch_parallelism: env_usize("FETCH_PARALLELISM", 16),
            debrid_parallelism: env_usize("DEBRID_PARALLELISM", 4),

            max_stream_expression_filters: env_usize("MAX_STREAM_EXPRESSION_FILTERS", 20),
            max_keyword_filters: env_usize("MAX_KEYWORD_FILTERS", 50),
            max_groups: env_usize("MAX_GROUPS", 10),
            regex_allow_list: env::var("REGEX_ALLOW_LIST")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),

            playback_link_validity_secs: env_u64("BUILTIN_PLAYBACK_LINK_VALIDITY", 7 * 24 * 3600),

            prune_max_days: env_u64("PRUNE_MAX_DAYS", 30) as i64,
            prune_interval_secs: env_u64("PRUNE_INTERVAL", 3600),

            force_proxy_enabled: env::var("FORCE_PROXY_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok()),
            force_proxy_url: env::var("FORCE_PROXY_URL").ok(),
            force_proxy_public_url: env::var("FORCE_PROXY_PUBLIC_URL").ok(),
            force_proxy_credentials: env::var("FORCE_PROXY_CREDENTIALS").ok(),

            default_service_api_keys,
            forced_service_api_keys,

            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| format!("streamhub/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn limits(&self) -> ConfigLimits {
        ConfigLimits {
            max_groups: self.max_groups,
            max_stream_expression_filters: self.max_stream_expression_filters,
            max_keyword_filters: self.max_keyword_filters,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("a=1, b=2,=3,c=");
        assert_eq!(
            pairs,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_parse_proxy_rule() {
        assert_eq!(parse_proxy_rule("true"), Some(ProxyRule::Always));
        assert_eq!(parse_proxy_rule("false"), Some(ProxyRule::Never));
        assert_eq!(parse_proxy_rule("1"), Some(ProxyRule::Index(1)));
        assert_eq!(parse_proxy_rule("nope"), None);
    }
}
