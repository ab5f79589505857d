//! Remote telemetry providers
//!
//! A provider hands back the current [`StatsSnapshot`] of one host. The HTTP
//! implementation talks to a sensord instance.

use async_trait::async_trait;
use reqwest::{Client, Response};
use sensor_common::{CoalescingCache, Result, SnapshotSource, StatsSnapshot, TelemetryError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn get_stats(&self, cancel: &CancellationToken) -> Result<StatsSnapshot>;
}

/// sensord over HTTP
pub struct HttpProvider {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpProvider {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        if request_timeout.is_zero() {
            return Err(TelemetryError::construction(
                "provider request timeout must be greater than 0",
            ));
        }

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TelemetryError::construction(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    /// Build a provider and verify the host answers its health check.
    pub async fn connect(
        base_url: &str,
        request_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let provider = Self::new(base_url, request_timeout)?;
        provider.health_check(cancel).await?;
        info!("  Connected to {}", provider.base_url);
        Ok(provider)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        self.get("/health", cancel).await.map(|_| ())
    }

    async fn get(&self, path: &str, cancel: &CancellationToken) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = cancellable(cancel, self.client.get(&url).send())
            .await?
            .map_err(|e| self.classify(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::upstream(
                format!("GET {}", url),
                format!("status {}: {}", status, body.trim()),
            ));
        }
        Ok(response)
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> TelemetryError {
        if err.is_timeout() {
            TelemetryError::Timeout(self.request_timeout)
        } else {
            TelemetryError::upstream(format!("GET {}", url), err)
        }
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TelemetryError::Cancelled),
        output = fut => Ok(output),
    }
}

#[async_trait]
impl TelemetryProvider for HttpProvider {
    async fn get_stats(&self, cancel: &CancellationToken) -> Result<StatsSnapshot> {
        let response = self.get("/api/v1/stats", cancel).await?;
        cancellable(cancel, response.json::<StatsSnapshot>())
            .await?
            .map_err(|e| TelemetryError::upstream("decode stats", e))
    }
}

struct ProviderSource(Arc<dyn TelemetryProvider>);

#[async_trait]
impl SnapshotSource<StatsSnapshot> for ProviderSource {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<StatsSnapshot> {
        self.0.get_stats(cancel).await
    }
}

/// Provider fronted by a [`CoalescingCache`]
pub struct CachedProvider {
    cache: CoalescingCache<StatsSnapshot>,
}

impl CachedProvider {
    pub fn new(
        inner: Arc<dyn TelemetryProvider>,
        retention: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            cache: CoalescingCache::new(Arc::new(ProviderSource(inner)), retention, fetch_timeout)?,
        })
    }
}

#[async_trait]
impl TelemetryProvider for CachedProvider {
    async fn get_stats(&self, cancel: &CancellationToken) -> Result<StatsSnapshot> {
        self.cache.get(cancel).await
    }
}
