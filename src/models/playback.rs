//! Wire types for the deferred playback endpoint: the base64 file-info
//! payload, the decrypted service auth and the stored title metadata.

use serde::{Deserialize, Serialize};

use crate::models::provider::ServiceId;

/// Payload carried base64-encoded in the playback URL. Stable wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// "torrent" or "usenet".
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nzb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_and_play: Option<bool>,
    /// Filename the user clicked, used as a tie-break hint when picking the
    /// matching file out of the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Decrypted content of the opaque `encryptedStoreAuth` path segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreAuth {
    pub id: ServiceId,
    pub credential: String,
}

/// Title metadata stored under a `metadataId` for the lifetime of a
/// playback link; the debrid resolver uses it to pick the right file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleMetadata {
    pub titles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absolute_episode: Option<u32>,
}

impl TitleMetadata {
    /// Short content-addressed id for the metadata cache.
    pub fn id(&self) -> String {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_info_round_trip() {
        let info = FileInfo {
            kind: "torrent".into(),
            hash: "deadbeef".into(),
            index: Some(2),
            sources: vec!["tracker:udp://x".into()],
            nzb: None,
            cache_and_play: Some(true),
            filename: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: FileInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash, "deadbeef");
        assert_eq!(back.index, Some(2));
        assert_eq!(back.cache_and_play, Some(true));
    }

    #[test]
    fn test_metadata_id_is_stable() {
        let meta = TitleMetadata {
            titles: vec!["Show".into()],
            year: Some(2020),
            season: Some(1),
            episode: Some(2),
            absolute_episode: None,
        };
        assert_eq!(meta.id(), meta.id());
        assert_eq!(meta.id().len(), 16);
    }
}
