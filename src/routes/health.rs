use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::db;
use crate::AppState;

/// Root endpoint - basic status
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "streamhub",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    uptime: u64,
    postgres: Option<bool>,
    redis: Option<bool>,
}

/// GET /health - backend connectivity check
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    let postgres = match &state.pool {
        Some(pool) => Some(db::health_check(pool).await),
        None => None,
    };
    let redis = match &state.redis {
        Some(redis) => Some(redis.ping().await.unwrap_or(false)),
        None => None,
    };

    let healthy = postgres.unwrap_or(true) && redis.unwrap_or(true);
    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        uptime,
        postgres,
        redis,
    })
}
