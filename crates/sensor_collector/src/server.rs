//! Metrics endpoint for sensor-collector

use crate::sink::PrometheusSink;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

type SinkArc = Arc<PrometheusSink>;

pub fn router(sink: SinkArc) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(sink)
        .layer(TraceLayer::new_for_http())
}

async fn metrics(State(sink): State<SinkArc>) -> Result<String, (StatusCode, String)> {
    sink.export().map_err(|e| {
        warn!("  Metrics export failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve metrics until `shutdown` is cancelled
pub async fn run(sink: SinkArc, listen: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("  Metrics on http://{}/metrics", listener.local_addr()?);

    axum::serve(listener, router(sink))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
