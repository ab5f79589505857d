//! Metrics sinks for collected sensor values

use prometheus::{
    register_counter_vec_with_registry, register_gauge_vec_with_registry, CounterVec, Encoder,
    GaugeVec, Registry, TextEncoder,
};
use sensor_common::{Hardware, Result, Sensor, TelemetryError};
use std::sync::Arc;

/// Identity of one reported value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorLabels {
    pub source: String,
    pub hardware_id: String,
    pub hardware_name: String,
    pub hardware_type: String,
    pub sensor_id: String,
    pub sensor_name: String,
    pub sensor_type: String,
}

impl SensorLabels {
    pub fn new(source: &str, hardware: &Hardware, sensor: &Sensor) -> Self {
        Self {
            source: source.to_string(),
            hardware_id: hardware.id.to_string(),
            hardware_name: hardware.name.clone(),
            hardware_type: hardware.kind.to_string(),
            sensor_id: sensor.id.to_string(),
            sensor_name: sensor.name.clone(),
            sensor_type: sensor.kind.to_string(),
        }
    }

    fn values(&self) -> [&str; 7] {
        [
            self.source.as_str(),
            self.hardware_id.as_str(),
            self.hardware_name.as_str(),
            self.hardware_type.as_str(),
            self.sensor_id.as_str(),
            self.sensor_name.as_str(),
            self.sensor_type.as_str(),
        ]
    }
}

/// Destination for collected values. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn report_sensor_value(&self, value: i64, labels: &SensorLabels);

    /// A source exhausted its attempts for one cycle.
    fn record_failure(&self, _source: &str) {}
}

const SENSOR_LABELS: [&str; 7] = [
    "host",
    "hardware_id",
    "hardware_name",
    "hardware_type",
    "sensor_id",
    "sensor_name",
    "sensor_type",
];

/// Prometheus-backed sink
#[derive(Clone)]
pub struct PrometheusSink {
    pub sensor_value: GaugeVec,
    pub collect_failures_total: CounterVec,

    registry: Arc<Registry>,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sensor_value = register_gauge_vec_with_registry!(
            "sensor_value",
            "Latest reading of a hardware sensor",
            &SENSOR_LABELS,
            registry
        )
        .map_err(|e| TelemetryError::construction(format!("register sensor_value: {}", e)))?;

        let collect_failures_total = register_counter_vec_with_registry!(
            "sensor_collect_failures_total",
            "Collection cycles in which a host exhausted its attempts",
            &["host"],
            registry
        )
        .map_err(|e| {
            TelemetryError::construction(format!("register sensor_collect_failures_total: {}", e))
        })?;

        Ok(Self {
            sensor_value,
            collect_failures_total,
            registry: Arc::new(registry),
        })
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::Internal(format!("encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| TelemetryError::Internal(format!("metrics are not utf-8: {}", e)))
    }
}

impl MetricsSink for PrometheusSink {
    fn report_sensor_value(&self, value: i64, labels: &SensorLabels) {
        self.sensor_value
            .with_label_values(&labels.values())
            .set(value as f64);
    }

    fn record_failure(&self, source: &str) {
        self.collect_failures_total
            .with_label_values(&[source])
            .inc();
    }
}
