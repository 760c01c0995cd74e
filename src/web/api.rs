use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{AppState, HealthResponse, StatsResponse};
use crate::config::ConfigUpdate;
use crate::engine::TIMESTAMP_HEADER;
use crate::types::{utc_to_epoch, InferenceRequest};

/// Inbound headers passed through to every backend call, matched
/// case-insensitively. `Timestamp` is handled separately.
const PASSTHROUGH_HEADERS: [&str; 3] = ["traceparent", "tracestate", "x-request-id"];

#[derive(Debug, Deserialize)]
pub struct EnsembleQuery {
    pub request_id: Option<String>,
}

/// Accept a raw payload for background fan-out. The caller only learns
/// whether the job was queued; the outcome ends up in the result store.
pub async fn post_ensemble(
    State(state): State<AppState>,
    Query(query): Query<EnsembleQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(request_id) = query.request_id.filter(|id| !id.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing request_id query parameter"})),
        )
            .into_response();
    };

    // producers that do not stamp requests get the arrival time
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or_else(|| utc_to_epoch(Utc::now()));

    debug!("Received {} bytes for {}", body.len(), request_id);
    let request = PASSTHROUGH_HEADERS
        .iter()
        .filter_map(|&name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name, value))
        })
        .fold(
            InferenceRequest::new(request_id.clone(), body).with_timestamp(Some(timestamp)),
            |request, (name, value)| request.with_header(name, value),
        );

    match state.jobs.submit(request) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({"response": format!("Ensemble request {} accepted for processing", request_id)})),
        )
            .into_response(),
        Err(e) => {
            warn!("Could not queue {}: {}", request_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

pub async fn post_change_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    match state.config.update(update).await {
        Ok(active) => (StatusCode::OK, Json(active.config.clone())).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.config.snapshot().await;
    Json(json!({
        "endpoints": active.config.endpoints,
        "strategy": active.config.strategy,
        "available_strategies": state.config.registry().names(),
    }))
}

pub async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.config.snapshot().await;
    Json(StatsResponse {
        jobs: state.stats.snapshot(),
        pending: state.jobs.pending(),
        strategy: active.strategy.name().to_string(),
        endpoints: active.endpoints().len(),
    })
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    })
}
