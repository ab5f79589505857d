//! Retention scheduler
//!
//! Evicts samples older than the retention window on a fixed interval.

use crate::store::SampleStore;
use sensor_common::{Result, SensorId, TelemetryError, TimeSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RetentionScheduler {
    store: Arc<dyn SampleStore>,
    clock: Arc<dyn TimeSource>,
    interval: Duration,
    window: chrono::Duration,
}

impl RetentionScheduler {
    pub fn new(
        store: Arc<dyn SampleStore>,
        clock: Arc<dyn TimeSource>,
        interval: Duration,
        window: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(TelemetryError::construction(
                "retention interval must be greater than 0",
            ));
        }
        if window.is_zero() {
            return Err(TelemetryError::construction(
                "retention window must be greater than 0",
            ));
        }
        let window = chrono::Duration::from_std(window).map_err(|_| {
            TelemetryError::construction(format!("retention window {:?} is too large", window))
        })?;

        Ok(Self {
            store,
            clock,
            interval,
            window,
        })
    }

    /// Remove everything older than `now - window`.
    pub fn prune_once(&self) -> Result<HashMap<SensorId, usize>> {
        let now = self.clock.now();
        let cutoff = now.checked_sub_signed(self.window).ok_or_else(|| {
            TelemetryError::Internal(format!("cutoff before {} overflows", now))
        })?;
        self.store.delete_older_values(cutoff)
    }

    /// Prune on every interval until `cancel` fires. The first prune happens
    /// one interval after start.
    pub async fn start(&self, cancel: CancellationToken) {
        info!(
            interval = ?self.interval,
            window = %self.window,
            "auto cleanup task started"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.prune_once() {
                Ok(removed) => {
                    let total: usize = removed.values().sum();
                    for (sensor, count) in removed.iter().filter(|(_, c)| **c > 0) {
                        debug!(sensor = %sensor, removed = count, "evicted old samples");
                    }
                    debug!(sensors = removed.len(), removed = total, "cleanup cycle complete");
                }
                Err(e) => warn!(error = %e, "cleanup cycle failed"),
            }
        }

        info!("auto cleanup task stopped");
    }

    /// Run [`Self::start`] on its own task. The loop also stops when `parent`
    /// is cancelled.
    pub fn spawn(self: Arc<Self>, parent: &CancellationToken) -> RetentionHandle {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.start(token).await });
        RetentionHandle { cancel, task }
    }
}

/// Running scheduler.
pub struct RetentionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RetentionHandle {
    /// Stop the loop and wait for it to exit. No store access happens after
    /// this returns.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "cleanup task did not exit cleanly");
        }
    }
}
