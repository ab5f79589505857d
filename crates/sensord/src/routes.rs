//! API routes for sensord

use crate::server::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use sensor_common::{StatsReport, StatsSnapshot, TelemetryError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type AppStateArc = Arc<AppState>;
type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

// ============================================================================
// Health Routes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Stats Routes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub range_secs: i64,
}

pub fn stats_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/api/v1/stats", get(current_stats))
        .route("/api/v1/stats/history", get(stats_history))
}

async fn current_stats(State(state): State<AppStateArc>) -> ApiResult<StatsSnapshot> {
    let cancel = state.shutdown.child_token();
    bounded(&state, &cancel, state.snapshots.get(&cancel)).await
}

async fn stats_history(
    State(state): State<AppStateArc>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<StatsReport> {
    info!("  Stats history for last {}s", query.range_secs);

    let range = chrono::Duration::try_seconds(query.range_secs).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("range_secs {} is out of bounds", query.range_secs),
        )
    })?;

    let cancel = state.shutdown.child_token();
    bounded(&state, &cancel, state.service.get_stats(&cancel, range)).await
}

/// Run `work` under the request timeout; on expiry the request's token is
/// cancelled so upstream calls stop too.
async fn bounded<T, F>(state: &AppState, cancel: &CancellationToken, work: F) -> ApiResult<T>
where
    F: Future<Output = sensor_common::Result<T>>,
{
    match tokio::time::timeout(state.request_timeout, work).await {
        Ok(Ok(value)) => Ok(Json(value)),
        Ok(Err(e)) => Err(error_response(e)),
        Err(_) => {
            cancel.cancel();
            warn!("Request timed out after {:?}", state.request_timeout);
            Err(error_response(TelemetryError::Timeout(state.request_timeout)))
        }
    }
}

pub fn error_response(err: TelemetryError) -> (StatusCode, String) {
    let status = match &err {
        TelemetryError::Validation(_) | TelemetryError::InvalidRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        TelemetryError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        TelemetryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        TelemetryError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        TelemetryError::Construction(_) | TelemetryError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        warn!("  Request failed ({}): {}", status, err);
    }
    (status, err.to_string())
}
