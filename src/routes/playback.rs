use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::sync::Arc;

use crate::models::{FileInfo, StoreAuth};
use crate::services::crypto::EncString;
use crate::services::debrid::Resolution;
use crate::AppState;

/// Downloading placeholder shown while an uncached job is in progress.
const DOWNLOADING_PLACEHOLDER: &str = "/static/downloading.mp4";

fn redirect(status: StatusCode, location: &str) -> Response {
    (status, [(header::LOCATION, location.to_string())]).into_response()
}

/// GET /playback/:auth/:info/:metadata_id/:filename
///
/// Click-time resolution of a deferred debrid stream: 307 to the final
/// playable URL, 302 to the downloading placeholder while the service is
/// still fetching, or 302 to an error placeholder keyed by the stable
/// debrid error code. URLs with an unknown metadataId or an undecryptable
/// auth segment are rejected outright.
pub async fn resolve_playback(
    State(state): State<Arc<AppState>>,
    Path((auth, info, metadata_id, _filename)): Path<(String, String, String, String)>,
) -> Response {
    let crypto = match &state.crypto {
        Some(crypto) => crypto,
        None => {
            return (StatusCode::SERVICE_UNAVAILABLE, "playback not configured").into_response()
        }
    };

    let auth = match EncString::from_raw(&auth) {
        value @ EncString::Ciphertext(_) => value,
        EncString::Plaintext(_) => {
            return (StatusCode::BAD_REQUEST, "auth must be encrypted").into_response()
        }
    };
    let auth: StoreAuth = match crypto
        .open(&auth)
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok())
    {
        Some(auth) => auth,
        None => return (StatusCode::BAD_REQUEST, "auth failed to decrypt").into_response(),
    };

    let file_info: FileInfo = match URL_SAFE_NO_PAD
        .decode(&info)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    {
        Some(info) => info,
        None => return (StatusCode::BAD_REQUEST, "invalid file info").into_response(),
    };

    let metadata = match state.metadata.get(&metadata_id).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            return (StatusCode::BAD_REQUEST, "unknown or expired playback link").into_response()
        }
        Err(e) => {
            tracing::error!("metadata lookup failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    match state
        .resolver
        .resolve(auth.id, &auth.credential, &file_info, &metadata)
        .await
    {
        Ok(Resolution::Ready { url }) => redirect(StatusCode::TEMPORARY_REDIRECT, &url),
        Ok(Resolution::Downloading) => {
            redirect(StatusCode::FOUND, DOWNLOADING_PLACEHOLDER)
        }
        Err(e) => {
            tracing::warn!(
                "playback resolve failed on {}: {}",
                auth.id.short_code(),
                e
            );
            redirect(StatusCode::FOUND, &e.code.placeholder_path())
        }
    }
}
