//! sensor-collector - scrape sensord hosts into Prometheus

use anyhow::{Context, Result};
use clap::Parser;
use sensor_collector::config::{Config, CONFIG_PATH};
use sensor_collector::{server, CachedProvider, FanOutCollector, HttpProvider, PrometheusSink, TelemetryProvider};
use sensor_common::logging;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sensor-collector")]
#[command(about = "Collect sensor values from sensord hosts into Prometheus", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(long, short, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Hosts to collect from (replaces the configured list)
    #[arg(long = "host")]
    hosts: Vec<String>,
}

async fn provider_for(
    host: &str,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<Arc<dyn TelemetryProvider>> {
    let provider = match HttpProvider::connect(host, config.request_timeout(), cancel).await {
        Ok(provider) => provider,
        Err(e) => {
            // Down hosts are retried every cycle.
            warn!("[BOOT] Health check for {} failed: {}", host, e);
            HttpProvider::new(host, config.request_timeout())?
        }
    };

    let provider: Arc<dyn TelemetryProvider> = Arc::new(provider);
    match config.cache_retention() {
        Some(retention) => Ok(Arc::new(CachedProvider::new(
            provider,
            retention,
            config.request_timeout(),
        )?)),
        None => Ok(provider),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if !cli.hosts.is_empty() {
        config.hosts = cli.hosts;
        config.validate()?;
    }

    logging::init(&config.logging.level);
    info!("[BOOT] sensor-collector v{} starting...", env!("CARGO_PKG_VERSION"));
    if cli.config.exists() {
        info!("[BOOT] Config loaded from {}", cli.config.display());
    } else {
        warn!("[BOOT] No config at {}, using defaults", cli.config.display());
    }

    let shutdown = CancellationToken::new();

    let mut providers = BTreeMap::new();
    for host in &config.hosts {
        let provider = provider_for(host, &config, &shutdown)
            .await
            .with_context(|| format!("Failed to set up provider for {}", host))?;
        providers.insert(host.clone(), provider);
    }
    info!("[BOOT] {} host(s) configured", providers.len());

    let sink = Arc::new(PrometheusSink::new().context("Failed to register metrics")?);
    let collector = Arc::new(
        FanOutCollector::new(
            providers,
            sink.clone(),
            config.interval(),
            config.timeout(),
            config.retry_policy(),
        )
        .context("Failed to set up collector")?,
    );

    let collecting = tokio::spawn(Arc::clone(&collector).collect(shutdown.clone()));

    let listen = config.metrics.listen.clone();
    let metrics_shutdown = shutdown.clone();
    let mut http = tokio::spawn(async move { server::run(sink, &listen, metrics_shutdown).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down gracefully");
        }
        result = &mut http => {
            match result {
                Ok(Ok(())) => warn!("Metrics server exited"),
                Ok(Err(e)) => error!("Metrics server failed: {:#}", e),
                Err(e) => error!("Metrics server task failed: {}", e),
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = collecting.await {
        warn!("Collector task did not exit cleanly: {}", e);
    }
    if !http.is_finished() {
        if let Err(e) = http.await {
            warn!("Metrics task did not exit cleanly: {}", e);
        }
    }

    info!("sensor-collector stopped");
    Ok(())
}
