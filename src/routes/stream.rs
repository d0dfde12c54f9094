use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::users;
use crate::models::{MediaType, RawStream, Resource, UserConfig};
use crate::services::addon::StreamQuery;
use crate::services::crypto::EncString;
use crate::services::orchestrator::PipelineError;
use crate::AppState;

#[derive(serde::Serialize)]
pub struct StreamsResponse {
    streams: Vec<RawStream>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveConfigRequest {
    pub password: String,
    pub config: UserConfig,
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

/// GET /u/:uuid/stream/:type/:id.json
///
/// The aggregation endpoint: loads the user's config, runs the pipeline
/// and returns the ranked stream list.
pub async fn get_streams(
    State(state): State<Arc<AppState>>,
    Path((uuid, media_type, id)): Path<(String, String, String)>,
) -> Result<Json<StreamsResponse>, (StatusCode, Json<serde_json::Value>)> {
    let uuid: Uuid = uuid
        .parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid user id".into()))?;

    let media_type: MediaType = media_type
        .parse()
        .map_err(|e: String| error_response(StatusCode::BAD_REQUEST, e))?;

    let id = id.trim_end_matches(".json").to_string();

    let user = load_user_config(&state, uuid).await?;

    let query = StreamQuery {
        resource: Resource::Stream,
        media_type,
        id,
        extras: vec![],
    };

    let streams = state
        .orchestrator
        .handle(&query, &user)
        .await
        .map_err(|e| match e {
            PipelineError::InvalidConfig(_)
            | PipelineError::Filter(_)
            | PipelineError::Expression(_) => {
                error_response(StatusCode::BAD_REQUEST, e.to_string())
            }
            PipelineError::Internal(_) => {
                tracing::error!("stream request failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        })?;

    Ok(Json(StreamsResponse { streams }))
}

/// PUT /u/:uuid/config
///
/// Persist a user's configuration: validate against the operator limits,
/// encrypt at rest when a secret is configured, and guard re-saves with
/// the password chosen on first save.
pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Json(body): Json<SaveConfigRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let uuid: Uuid = uuid
        .parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid user id".into()))?;

    let pool = state.pool.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no user store configured".into(),
        )
    })?;

    body.config
        .validate(&state.config.limits())
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e))?;

    // Re-saving an existing config requires the original password.
    let existing = users::find_by_uuid(pool, uuid).await.map_err(|e| {
        tracing::error!("user lookup failed: {}", e);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
    })?;
    let salt = match &existing {
        Some(row) => {
            if hash_password(&row.config_salt, &body.password) != row.password_hash {
                return Err(error_response(
                    StatusCode::UNAUTHORIZED,
                    "wrong password".into(),
                ));
            }
            row.config_salt.clone()
        }
        None => {
            let mut bytes = [0u8; 16];
            rand::rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
    };
    let password_hash = hash_password(&salt, &body.password);

    let config_json = serde_json::to_string(&body.config).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid configuration: {}", e),
        )
    })?;
    let ciphertext = match &state.crypto {
        Some(crypto) => crypto.seal(&config_json).to_raw(),
        None => config_json,
    };

    users::upsert(pool, uuid, &password_hash, &ciphertext, &salt)
        .await
        .map_err(|e| {
            tracing::error!("config save failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
        })?;

    Ok(StatusCode::NO_CONTENT)
}

fn hash_password(salt: &str, password: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

async fn load_user_config(
    state: &AppState,
    uuid: Uuid,
) -> Result<UserConfig, (StatusCode, Json<serde_json::Value>)> {
    let pool = state.pool.as_ref().ok_or_else(|| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no user store configured".into(),
        )
    })?;

    let row = users::find_by_uuid(pool, uuid)
        .await
        .map_err(|e| {
            tracing::error!("user lookup failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
        })?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "unknown user".into()))?;

    if let Err(e) = users::touch_accessed(pool, uuid).await {
        tracing::warn!("failed to touch user access time: {}", e);
    }

    let config_json = match &state.crypto {
        Some(crypto) => crypto
            .open(&EncString::from_raw(&row.config_ciphertext))
            .map_err(|_| {
                error_response(StatusCode::BAD_REQUEST, "config failed to decrypt".into())
            })?,
        None => row.config_ciphertext.clone(),
    };

    serde_json::from_str(&config_json).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid configuration: {}", e),
        )
    })
}

/// GET /stream/:type/:id.json — anonymous variant used when the deployment
/// runs with a single operator-provided configuration.
pub async fn get_streams_anonymous(
    State(state): State<Arc<AppState>>,
    Path((media_type, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let media_type: MediaType = match media_type.parse() {
        Ok(t) => t,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e).into_response(),
    };
    let id = id.trim_end_matches(".json").to_string();
    let user = UserConfig {
        user_id: "anonymous".into(),
        providers: vec![],
        services: vec![],
        groups: vec![],
        group_behaviour: crate::models::GroupBehaviour::Parallel,
        dynamic_fetch_condition: None,
        filters: Default::default(),
        dedup: Default::default(),
        sort: Default::default(),
        proxy: Default::default(),
        format: Default::default(),
        hide_errors: false,
        hide_errors_for_resources: vec![],
        cache_and_play: vec![],
        trusted_regex: false,
    };
    let query = StreamQuery {
        resource: Resource::Stream,
        media_type,
        id,
        extras: vec![],
    };
    match state.orchestrator.handle(&query, &user).await {
        Ok(streams) => Json(StreamsResponse { streams }).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password_depends_on_salt() {
        let a = hash_password("salt-a", "hunter2");
        let b = hash_password("salt-b", "hunter2");
        assert_ne!(a, b);
        assert_eq!(a, hash_password("salt-a", "hunter2"));
        assert_eq!(a.len(), 40);
    }
}
