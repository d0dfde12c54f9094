//! Proxifier
//!
//! Rewrites playback URLs through the user's streaming proxy when the
//! stream's provider or detected service is marked for proxying. The
//! original URL travels as a base64url parameter alongside the proxy
//! credentials. External, youtube and error streams are never proxified.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use crate::config::Config;
use crate::models::{ParsedStream, ProxyConfig, StreamType, UserConfig};

/// Apply operator FORCE_PROXY_* overrides on top of the user's proxy
/// configuration. Forced fields always win.
pub fn effective_proxy(user: &ProxyConfig, config: &Config) -> ProxyConfig {
    let mut proxy = user.clone();
    if let Some(enabled) = config.force_proxy_enabled {
        proxy.enabled = enabled;
    }
    if let Some(url) = &config.force_proxy_url {
        proxy.url = Some(url.clone());
    }
    if let Some(public_url) = &config.force_proxy_public_url {
        proxy.public_url = Some(public_url.clone());
    }
    if let Some(credentials) = &config.force_proxy_credentials {
        proxy.credentials = Some(credentials.clone());
    }
    proxy
}

pub struct Proxifier {
    proxy: ProxyConfig,
    proxied_addons: Vec<String>,
    proxied_services: Vec<crate::models::ServiceId>,
}

impl Proxifier {
    pub fn new(user_config: &UserConfig, config: &Config) -> Self {
        Self {
            proxy: effective_proxy(&user_config.proxy, config),
            proxied_addons: user_config.proxy.proxied_addons.clone(),
            proxied_services: user_config.proxy.proxied_services.clone(),
        }
    }

    fn should_proxy(&self, stream: &ParsedStream) -> bool {
        if !self.proxy.enabled {
            return false;
        }
        if matches!(
            stream.stream_type,
            StreamType::External | StreamType::Youtube | StreamType::Error
        ) {
            return false;
        }
        if stream.url.is_none() {
            return false;
        }
        self.proxied_addons
            .iter()
            .any(|id| *id == stream.addon.instance_id)
            || stream
                .service
                .as_ref()
                .map(|s| self.proxied_services.contains(&s.id))
                .unwrap_or(false)
    }

    /// Rewrite eligible streams in place.
    pub fn apply(&self, streams: &mut [ParsedStream]) {
        let base = match self.proxy.public_base() {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => return,
        };
        for stream in streams.iter_mut() {
            if !self.should_proxy(stream) {
                continue;
            }
            let original = stream.url.take().expect("checked by should_proxy");
            let mut rewritten = format!(
                "{}/proxy/stream?d={}",
                base,
                URL_SAFE_NO_PAD.encode(original.as_bytes())
            );
            if let Some(credentials) = &self.proxy.credentials {
                rewritten.push_str("&token=");
                rewritten.push_str(credentials);
            }
            stream.url = Some(rewritten);
            stream.proxied = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AddonRef, ServiceId, ServiceRef};

    fn stream(addon: &str, stream_type: StreamType) -> ParsedStream {
        let mut s = ParsedStream::error(
            AddonRef {
                instance_id: addon.into(),
                name: addon.to_uppercase(),
            },
            "x",
            None,
        );
        s.error = None;
        s.stream_type = stream_type;
        s.url = Some("https://upstream.example.com/video.mkv".into());
        s
    }

    fn user_config(proxy: ProxyConfig) -> UserConfig {
        UserConfig {
            user_id: "u".into(),
            providers: vec![],
            services: vec![],
            groups: vec![],
            group_behaviour: crate::models::GroupBehaviour::Parallel,
            dynamic_fetch_condition: None,
            filters: Default::default(),
            dedup: Default::default(),
            sort: Default::default(),
            proxy,
            format: Default::default(),
            hide_errors: false,
            hide_errors_for_resources: vec![],
            cache_and_play: vec![],
            trusted_regex: false,
        }
    }

    fn plain_config() -> Config {
        Config::from_env()
    }

    #[test]
    fn test_proxies_listed_addon() {
        let proxy = ProxyConfig {
            enabled: true,
            url: Some("https://proxy.example.com".into()),
            public_url: None,
            credentials: Some("secret".into()),
            proxied_addons: vec!["a1".into()],
            proxied_services: vec![],
        };
        let user = user_config(proxy);
        let proxifier = Proxifier::new(&user, &plain_config());

        let mut streams = vec![stream("a1", StreamType::Http), stream("a2", StreamType::Http)];
        proxifier.apply(&mut streams);

        assert!(streams[0].proxied);
        let url = streams[0].url.as_ref().unwrap();
        assert!(url.starts_with("https://proxy.example.com/proxy/stream?d="));
        assert!(url.contains("&token=secret"));
        assert!(!streams[1].proxied);
    }

    #[test]
    fn test_proxies_by_service() {
        let proxy = ProxyConfig {
            enabled: true,
            url: Some("https://proxy.example.com".into()),
            public_url: None,
            credentials: None,
            proxied_addons: vec![],
            proxied_services: vec![ServiceId::RealDebrid],
        };
        let user = user_config(proxy);
        let proxifier = Proxifier::new(&user, &plain_config());

        let mut streams = vec![stream("a1", StreamType::Debrid)];
        streams[0].service = Some(ServiceRef {
            id: ServiceId::RealDebrid,
            cached: true,
        });
        proxifier.apply(&mut streams);
        assert!(streams[0].proxied);
    }

    #[test]
    fn test_never_proxies_external_youtube_error() {
        let proxy = ProxyConfig {
            enabled: true,
            url: Some("https://proxy.example.com".into()),
            public_url: None,
            credentials: None,
            proxied_addons: vec!["a1".into()],
            proxied_services: vec![],
        };
        let user = user_config(proxy);
        let proxifier = Proxifier::new(&user, &plain_config());

        let mut streams = vec![
            stream("a1", StreamType::External),
            stream("a1", StreamType::Youtube),
        ];
        proxifier.apply(&mut streams);
        assert!(!streams[0].proxied);
        assert!(!streams[1].proxied);
    }

    #[test]
    fn test_disabled_proxy_is_inert() {
        let proxy = ProxyConfig {
            enabled: false,
            url: Some("https://proxy.example.com".into()),
            public_url: None,
            credentials: None,
            proxied_addons: vec!["a1".into()],
            proxied_services: vec![],
        };
        let user = user_config(proxy);
        let proxifier = Proxifier::new(&user, &plain_config());
        let mut streams = vec![stream("a1", StreamType::Http)];
        proxifier.apply(&mut streams);
        assert!(!streams[0].proxied);
    }
}
