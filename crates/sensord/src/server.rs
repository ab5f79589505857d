//! HTTP server for sensord

use crate::routes;
use crate::service::OrchestrationService;
use anyhow::{Context, Result};
use axum::Router;
use sensor_common::{CoalescingCache, SnapshotSource, StatsSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<OrchestrationService>,
    /// Current readings, coalesced and briefly cached
    pub snapshots: CoalescingCache<StatsSnapshot>,
    pub request_timeout: Duration,
    /// Parent of every request token; cancelled on shutdown
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        service: Arc<OrchestrationService>,
        cache_retention: Duration,
        fetch_timeout: Duration,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> sensor_common::Result<Self> {
        let source: Arc<dyn SnapshotSource<StatsSnapshot>> = service.clone();
        let snapshots = CoalescingCache::new(source, cache_retention, fetch_timeout)?;

        Ok(Self {
            service,
            snapshots,
            request_timeout,
            shutdown,
            start_time: Instant::now(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health_routes())
        .merge(routes::stats_routes())
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until `shutdown` is cancelled
pub async fn run(state: AppState, listen: &str) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("  Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("  HTTP server stopped");
    Ok(())
}
