//! sensor-collector - multi-host sensor collection into Prometheus
//!
//! Polls any number of sensord hosts concurrently and republishes every
//! sensor value as a labelled gauge.

pub mod collector;
pub mod config;
pub mod provider;
pub mod server;
pub mod sink;

pub use collector::FanOutCollector;
pub use provider::{CachedProvider, HttpProvider, TelemetryProvider};
pub use sink::{MetricsSink, PrometheusSink, SensorLabels};
