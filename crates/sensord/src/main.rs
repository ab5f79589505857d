//! sensord - hardware telemetry daemon
//!
//! Polls local sensors, keeps a bounded history and serves it over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use sensor_common::{logging, SystemClock, TimeSource};
use sensord::config::{Config, CONFIG_PATH};
use sensord::{
    server, AppState, CachedInspector, OrchestrationService, RetentionScheduler,
    SysinfoInspector, TelemetryStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sensord")]
#[command(about = "Hardware sensor telemetry daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(long, short, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    logging::init(&config.logging.level);
    info!("[BOOT] sensord v{} starting...", env!("CARGO_PKG_VERSION"));
    if cli.config.exists() {
        info!("[BOOT] Config loaded from {}", cli.config.display());
    } else {
        warn!("[BOOT] No config at {}, using defaults", cli.config.display());
    }

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn TimeSource> = Arc::new(SystemClock);
    let store = Arc::new(TelemetryStore::new());

    let inspector = CachedInspector::new(
        Arc::new(SysinfoInspector::new()),
        config.cache_retention(),
        config.fetch_timeout(),
    )
    .context("Failed to set up hardware inspector")?;

    let service = Arc::new(OrchestrationService::new(
        Arc::clone(&clock),
        Arc::new(inspector),
        store.clone(),
    ));

    let retention = Arc::new(
        RetentionScheduler::new(
            store.clone(),
            clock,
            config.retention_interval(),
            config.retention_window(),
        )
        .context("Failed to set up retention scheduler")?,
    )
    .spawn(&shutdown);
    info!(
        "[BOOT] Retention active ({}s window, every {}s)",
        config.retention.window_secs, config.retention.interval_secs
    );

    let poller = {
        let service = Arc::clone(&service);
        let cancel = shutdown.clone();
        let interval = config.poll_interval();
        tokio::spawn(async move { service.run(cancel, interval).await })
    };
    info!("[BOOT] Polling every {}ms", config.polling.interval_ms);

    let state = AppState::new(
        service,
        config.cache_retention(),
        config.fetch_timeout(),
        config.request_timeout(),
        shutdown.clone(),
    )
    .context("Failed to set up HTTP state")?;

    let listen = config.server.listen.clone();
    let mut http = tokio::spawn(async move { server::run(state, &listen).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down gracefully");
        }
        result = &mut http => {
            match result {
                Ok(Ok(())) => warn!("HTTP server exited"),
                Ok(Err(e)) => error!("HTTP server failed: {:#}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = poller.await {
        warn!("Polling task did not exit cleanly: {}", e);
    }
    retention.stop().await;
    if !http.is_finished() {
        if let Err(e) = http.await {
            warn!("HTTP task did not exit cleanly: {}", e);
        }
    }
    store.close();

    info!("sensord stopped");
    Ok(())
}
