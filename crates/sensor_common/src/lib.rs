//! Shared types for the sensor telemetry daemons.
//!
//! `sensord` (per-host collection, history and HTTP API) and
//! `sensor-collector` (multi-host fan-out into Prometheus) both build on:
//! - the hardware/sensor data model
//! - the `TelemetryError` taxonomy
//! - `TimeSource` clocks
//! - request coalescing (`CallGroup`, `CoalescingCache`)
//! - the bounded retry combinator

pub mod coalesce;
pub mod error;
pub mod logging;
pub mod model;
pub mod retry;
pub mod time;

pub use coalesce::{CallGroup, CallOutcome, CoalescingCache, SnapshotSource};
pub use error::{Result, TelemetryError};
pub use model::{
    Hardware, HardwareHistory, HardwareId, HardwareReading, HardwareType, Sample, Sensor,
    SensorHistory, SensorId, SensorReading, SensorType, StatsReport, StatsSnapshot, Topology,
    Unit,
};
pub use retry::{BackoffConfig, RetryPolicy};
pub use time::{ManualClock, SystemClock, TimeSource};
