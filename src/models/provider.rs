//! Provider descriptors and debrid service credentials.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource kinds an addon may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Stream,
    Subtitles,
    Catalog,
    Meta,
    AddonCatalog,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Resource::Stream => "stream",
            Resource::Subtitles => "subtitles",
            Resource::Catalog => "catalog",
            Resource::Meta => "meta",
            Resource::AddonCatalog => "addon_catalog",
        };
        write!(f, "{}", s)
    }
}

/// Media kinds a request can be for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Series,
    Anime,
    Channel,
    Tv,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaType::Movie => "movie",
            MediaType::Series => "series",
            MediaType::Anime => "anime",
            MediaType::Channel => "channel",
            MediaType::Tv => "tv",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaType::Movie),
            "series" => Ok(MediaType::Series),
            "anime" => Ok(MediaType::Anime),
            "channel" => Ok(MediaType::Channel),
            "tv" => Ok(MediaType::Tv),
            other => Err(format!("unknown media type: {}", other)),
        }
    }
}

/// Immutable description of one upstream addon instance, produced by a
/// preset factory from the user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    /// Unique within a user configuration; must not contain `.` because it
    /// is embedded in dotted stream ids.
    pub instance_id: String,
    pub manifest_url: String,
    pub display_name: String,
    /// Preset identifier this descriptor was produced from.
    pub identifier: String,
    pub short_id: String,
    /// Per-provider timeout in milliseconds.
    pub timeout_ms: u64,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub media_types: Vec<MediaType>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub force_to_top: bool,
    /// Streams from this provider are already in the user's library.
    #[serde(default)]
    pub library: bool,
    /// Skip the formatter for this provider's streams.
    #[serde(default)]
    pub format_passthrough: bool,
    /// Skip filtering/dedup/sorting for this provider's streams.
    #[serde(default)]
    pub result_passthrough: bool,
}

impl ProviderDescriptor {
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_id.is_empty() {
            return Err("provider instanceId must not be empty".into());
        }
        if self.instance_id.contains('.') {
            return Err(format!(
                "provider instanceId '{}' must not contain '.'",
                self.instance_id
            ));
        }
        Ok(())
    }

    pub fn supports(&self, resource: Resource, media_type: MediaType) -> bool {
        self.resources.contains(&resource)
            && (self.media_types.is_empty() || self.media_types.contains(&media_type))
    }
}

/// Known debrid services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    RealDebrid,
    AllDebrid,
    Premiumize,
    DebridLink,
    Torbox,
    EasyDebrid,
    Debrider,
    Putio,
    PikPak,
    Offcloud,
    Seedr,
    Easynews,
}

impl ServiceId {
    pub const ALL: [ServiceId; 12] = [
        ServiceId::RealDebrid,
        ServiceId::AllDebrid,
        ServiceId::Premiumize,
        ServiceId::DebridLink,
        ServiceId::Torbox,
        ServiceId::EasyDebrid,
        ServiceId::Debrider,
        ServiceId::Putio,
        ServiceId::PikPak,
        ServiceId::Offcloud,
        ServiceId::Seedr,
        ServiceId::Easynews,
    ];

    /// Short code used in logs and playback error reporting.
    pub fn short_code(&self) -> &'static str {
        match self {
            ServiceId::RealDebrid => "RD",
            ServiceId::AllDebrid => "AD",
            ServiceId::Premiumize => "PM",
            ServiceId::DebridLink => "DL",
            ServiceId::Torbox => "TB",
            ServiceId::EasyDebrid => "ED",
            ServiceId::Debrider => "DB",
            ServiceId::Putio => "PO",
            ServiceId::PikPak => "PP",
            ServiceId::Offcloud => "OC",
            ServiceId::Seedr => "SD",
            ServiceId::Easynews => "EN",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::RealDebrid => "realdebrid",
            ServiceId::AllDebrid => "alldebrid",
            ServiceId::Premiumize => "premiumize",
            ServiceId::DebridLink => "debridlink",
            ServiceId::Torbox => "torbox",
            ServiceId::EasyDebrid => "easydebrid",
            ServiceId::Debrider => "debrider",
            ServiceId::Putio => "putio",
            ServiceId::PikPak => "pikpak",
            ServiceId::Offcloud => "offcloud",
            ServiceId::Seedr => "seedr",
            ServiceId::Easynews => "easynews",
        }
    }

    /// Hostname fragments that identify a service in a stream URL.
    pub fn host_tokens(&self) -> &'static [&'static str] {
        match self {
            ServiceId::RealDebrid => &["real-debrid", "rdeb"],
            ServiceId::AllDebrid => &["alldebrid", "debrid.it"],
            ServiceId::Premiumize => &["premiumize"],
            ServiceId::DebridLink => &["debrid-link"],
            ServiceId::Torbox => &["torbox"],
            ServiceId::EasyDebrid => &["easydebrid"],
            ServiceId::Debrider => &["debrider"],
            ServiceId::Putio => &["put.io", "putio"],
            ServiceId::PikPak => &["mypikpak", "pikpak"],
            ServiceId::Offcloud => &["offcloud"],
            ServiceId::Seedr => &["seedr"],
            ServiceId::Easynews => &["easynews"],
        }
    }

    /// Tokens addons commonly put in stream names to mark service and cache
    /// state, e.g. "[RD+]" for cached real-debrid.
    pub fn name_tokens(&self) -> &'static [&'static str] {
        match self {
            ServiceId::RealDebrid => &["RD", "Real-Debrid", "RealDebrid"],
            ServiceId::AllDebrid => &["AD", "AllDebrid"],
            ServiceId::Premiumize => &["PM", "Premiumize"],
            ServiceId::DebridLink => &["DL", "Debrid-Link", "DebridLink"],
            ServiceId::Torbox => &["TB", "TRB", "TorBox"],
            ServiceId::EasyDebrid => &["ED", "EasyDebrid"],
            ServiceId::Debrider => &["DB", "Debrider"],
            ServiceId::Putio => &["PO", "Put.io", "Putio"],
            ServiceId::PikPak => &["PP", "PikPak"],
            ServiceId::Offcloud => &["OC", "Offcloud"],
            ServiceId::Seedr => &["SD", "Seedr"],
            ServiceId::Easynews => &["EN", "Easynews"],
        }
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User credentials for one debrid service. Values may be stored as
/// marker-prefixed ciphertext; `crypto::EncString` distinguishes the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCredential {
    pub service_id: ServiceId,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub credential_map: HashMap<String, String>,
}

impl ServiceCredential {
    /// The primary API key, under whichever key the service stores it.
    pub fn api_key(&self) -> Option<&str> {
        self.credential_map
            .get("apiKey")
            .or_else(|| self.credential_map.get("token"))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_rejects_dot() {
        let descriptor = ProviderDescriptor {
            instance_id: "tor.rentio".into(),
            manifest_url: "https://example.com/manifest.json".into(),
            display_name: "X".into(),
            identifier: "x".into(),
            short_id: "x1".into(),
            timeout_ms: 5000,
            resources: vec![Resource::Stream],
            media_types: vec![MediaType::Movie],
            extra_headers: HashMap::new(),
            force_to_top: false,
            library: false,
            format_passthrough: false,
            result_passthrough: false,
        };
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_supports_defaults_to_all_media_types() {
        let descriptor = ProviderDescriptor {
            instance_id: "a".into(),
            manifest_url: "https://example.com/manifest.json".into(),
            display_name: "X".into(),
            identifier: "x".into(),
            short_id: "x1".into(),
            timeout_ms: 5000,
            resources: vec![Resource::Stream],
            media_types: vec![],
            extra_headers: HashMap::new(),
            force_to_top: false,
            library: false,
            format_passthrough: false,
            result_passthrough: false,
        };
        assert!(descriptor.supports(Resource::Stream, MediaType::Anime));
        assert!(!descriptor.supports(Resource::Catalog, MediaType::Anime));
    }
}
