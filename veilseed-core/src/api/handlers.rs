//! Status API handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use super::ApiState;
use crate::tunnel::{CircuitSummary, ManagerStats, TierSummary};

#[derive(Debug, Serialize)]
pub struct CircuitsResponse {
    pub tiers: Vec<TierSummary>,
    pub circuits: Vec<CircuitSummary>,
    pub degraded_tiers: Vec<usize>,
    pub stats: ManagerStats,
}

#[derive(Debug, Serialize)]
pub struct ShutdownResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// GET /health
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let report = state.health.check_health().await;
    let status = StatusCode::from_u16(report.status.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(report))
}

/// GET /circuits
pub async fn circuits(State(state): State<Arc<ApiState>>) -> axum::response::Response {
    let manager = state
        .tunnel
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();

    match manager {
        Some(manager) => Json(CircuitsResponse {
            tiers: manager.tier_summaries(),
            circuits: manager.circuits(),
            degraded_tiers: manager.degraded_tiers(),
            stats: manager.stats(),
        })
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "tunnel community not running".to_string(),
            }),
        )
            .into_response(),
    }
}

/// POST /shutdown
pub async fn shutdown(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.shutdown.trigger().await;
    (
        StatusCode::ACCEPTED,
        Json(ShutdownResponse {
            status: "shutting_down",
        }),
    )
}
