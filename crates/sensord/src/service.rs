//! Orchestration service
//!
//! Coordinates the clock, the hardware inspector and the sample store:
//! each cycle reads the topology and current readings, stores one sample per
//! reported sensor at "now", and answers history queries over
//! `[now - range, now]`.

use crate::inspector::HardwareInspector;
use crate::store::SampleStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sensor_common::{
    HardwareHistory, Result, Sample, Sensor, SensorHistory, SnapshotSource, StatsReport,
    StatsSnapshot, TelemetryError, TimeSource, Topology,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct OrchestrationService {
    clock: Arc<dyn TimeSource>,
    inspector: Arc<dyn HardwareInspector>,
    store: Arc<dyn SampleStore>,
}

impl OrchestrationService {
    pub fn new(
        clock: Arc<dyn TimeSource>,
        inspector: Arc<dyn HardwareInspector>,
        store: Arc<dyn SampleStore>,
    ) -> Self {
        Self {
            clock,
            inspector,
            store,
        }
    }

    async fn read_current(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Topology, HashMap<Sensor, f64>)> {
        debug!("get sensors");
        let topology = self
            .inspector
            .list_hardware_with_sensors(cancel)
            .await
            .map_err(|e| e.context("get sensors"))?;

        debug!("get current values");
        let values = self
            .inspector
            .current_sensor_values(cancel)
            .await
            .map_err(|e| e.context("get current values"))?;

        Ok((topology, values))
    }

    fn persist(&self, snapshot: &StatsSnapshot) -> Result<usize> {
        debug!("store values");
        for reading in snapshot.hardware.iter().flat_map(|hw| &hw.sensors) {
            self.store
                .store_value(&reading.sensor.id, reading.value)
                .map_err(|e| e.context("store value"))?;
        }
        Ok(snapshot.sensor_count())
    }

    /// Current readings, not persisted.
    pub async fn snapshot(&self, cancel: &CancellationToken) -> Result<StatsSnapshot> {
        let (topology, values) = self.read_current(cancel).await?;
        Ok(StatsSnapshot::build(&topology, &values, self.clock.now()))
    }

    /// One snapshot-and-persist cycle. Returns how many samples were stored.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<usize> {
        let snapshot = self.snapshot(cancel).await?;
        self.persist(&snapshot)
    }

    /// Store the current readings, then return the history of every known
    /// sensor over the last `range`.
    ///
    /// The whole call fails on the first inspector or store error; no partial
    /// report is returned.
    pub async fn get_stats(
        &self,
        cancel: &CancellationToken,
        range: chrono::Duration,
    ) -> Result<StatsReport> {
        if range <= chrono::Duration::zero() {
            return Err(TelemetryError::validation(format!(
                "range must be greater than 0, got {}",
                range
            )));
        }

        let (topology, values) = self.read_current(cancel).await?;
        let now = self.clock.now();
        let from = now
            .checked_sub_signed(range)
            .ok_or_else(|| TelemetryError::validation(format!("range {} is too large", range)))?;

        self.persist(&StatsSnapshot::build(&topology, &values, now))?;

        let report = self.build_report(&topology, from, now)?;
        debug!(%from, to = %now, hardware = report.hardware.len(), "built stats report");
        Ok(report)
    }

    fn build_report(
        &self,
        topology: &Topology,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<StatsReport> {
        let mut hardware = Vec::with_capacity(topology.len());

        for (hw, sensors) in topology {
            let mut by_type: BTreeMap<_, Vec<SensorHistory>> = BTreeMap::new();

            for sensor in sensors {
                let samples: Vec<Sample> = self
                    .store
                    .get_values_for_range(&sensor.id, from, to)
                    .map_err(|e| e.context("get values for range"))?;

                by_type.entry(sensor.kind).or_default().push(SensorHistory {
                    sensor: sensor.clone(),
                    samples,
                });
            }

            for histories in by_type.values_mut() {
                histories.sort_by(|a, b| a.sensor.id.cmp(&b.sensor.id));
            }

            hardware.push(HardwareHistory {
                hardware: hw.clone(),
                sensors: by_type,
            });
        }
        hardware.sort_by(|a, b| a.hardware.id.cmp(&b.hardware.id));

        Ok(StatsReport {
            generated_at: self.clock.now(),
            from,
            to,
            hardware,
        })
    }

    /// Poll every `interval` until cancelled. A failed cycle is logged and
    /// the next tick tries again.
    pub async fn run(&self, cancel: CancellationToken, interval: Duration) {
        info!("[POLL] Polling loop started (every {:?})", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll(&cancel).await {
                Ok(stored) => debug!(stored, "poll cycle complete"),
                Err(TelemetryError::Cancelled) => break,
                Err(e) => warn!(error = %e, "poll cycle failed"),
            }
        }

        info!("[POLL] Polling loop stopped");
    }
}

#[async_trait]
impl SnapshotSource<StatsSnapshot> for OrchestrationService {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<StatsSnapshot> {
        self.snapshot(cancel).await
    }
}
