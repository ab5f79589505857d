//! In-memory telemetry store
//!
//! One ordered sequence per sensor, created lazily on first write. The map
//! lock only guards the set of sequences; each sequence has its own lock, so
//! reads and writes for unrelated sensors never contend.

use chrono::{DateTime, Utc};
use sensor_common::{Result, Sample, SensorId, TelemetryError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

/// Sample persistence used by the orchestration service and the retention
/// scheduler.
pub trait SampleStore: Send + Sync {
    /// Insert `sample`, replacing any sample at the same timestamp.
    fn store_value(&self, sensor: &SensorId, sample: Sample) -> Result<()>;

    /// Samples with `from <= timestamp <= to`, ascending.
    fn get_values_for_range(
        &self,
        sensor: &SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>>;

    /// Remove samples with `timestamp < cutoff` for every sensor. Returns the
    /// number removed per sensor.
    fn delete_older_values(&self, cutoff: DateTime<Utc>) -> Result<HashMap<SensorId, usize>>;
}

type Series = Arc<Mutex<BTreeMap<DateTime<Utc>, i64>>>;

fn lock_series(series: &Series) -> MutexGuard<'_, BTreeMap<DateTime<Utc>, i64>> {
    series.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct TelemetryStore {
    series: RwLock<HashMap<SensorId, Series>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, sensor: &SensorId) -> Option<Series> {
        let map = self.series.read().unwrap_or_else(PoisonError::into_inner);
        map.get(sensor).cloned()
    }

    fn find_or_create(&self, sensor: &SensorId) -> Series {
        if let Some(series) = self.find(sensor) {
            return series;
        }

        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(sensor.clone())
            .or_insert_with(|| {
                debug!(sensor = %sensor, "creating sample sequence");
                Arc::default()
            })
            .clone()
    }

    fn all(&self) -> Vec<(SensorId, Series)> {
        let map = self.series.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .map(|(id, series)| (id.clone(), Arc::clone(series)))
            .collect()
    }

    /// Drop every sequence. The store stays usable: reads return nothing and
    /// writes start new sequences.
    pub fn close(&self) {
        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        debug!(sensors = map.len(), "closing telemetry store");
        map.clear();
    }

    /// Number of sensors with a sequence (possibly empty after pruning)
    pub fn sensor_count(&self) -> usize {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn sample_count(&self, sensor: &SensorId) -> usize {
        self.find(sensor)
            .map(|series| lock_series(&series).len())
            .unwrap_or(0)
    }
}

impl SampleStore for TelemetryStore {
    fn store_value(&self, sensor: &SensorId, sample: Sample) -> Result<()> {
        let series = self.find_or_create(sensor);
        let replaced = lock_series(&series).insert(sample.timestamp, sample.value);

        debug!(
            sensor = %sensor,
            value = sample.value,
            timestamp = %sample.timestamp,
            replaced = replaced.is_some(),
            "stored sample"
        );
        Ok(())
    }

    fn get_values_for_range(
        &self,
        sensor: &SensorId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        if from > to {
            return Err(TelemetryError::InvalidRange { from, to });
        }

        let Some(series) = self.find(sensor) else {
            debug!(sensor = %sensor, "range query for unknown sensor");
            return Ok(Vec::new());
        };

        let samples: Vec<Sample> = lock_series(&series)
            .range(from..=to)
            .map(|(timestamp, value)| Sample::new(*value, *timestamp))
            .collect();

        debug!(sensor = %sensor, %from, %to, count = samples.len(), "range query");
        Ok(samples)
    }

    fn delete_older_values(&self, cutoff: DateTime<Utc>) -> Result<HashMap<SensorId, usize>> {
        let mut removed = HashMap::new();

        for (sensor, series) in self.all() {
            let mut samples = lock_series(&series);
            let kept = samples.split_off(&cutoff);
            let count = samples.len();
            *samples = kept;
            drop(samples);

            debug!(sensor = %sensor, %cutoff, removed = count, "pruned samples");
            removed.insert(sensor, count);
        }

        Ok(removed)
    }
}
