//! Hardware inspector seam
//!
//! The orchestration service only sees [`HardwareInspector`]. The live
//! implementation is [`crate::hardware::SysinfoInspector`]; tests use
//! scripted fakes.

use async_trait::async_trait;
use sensor_common::{CoalescingCache, Result, Sensor, SnapshotSource, Topology};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait HardwareInspector: Send + Sync {
    /// Current hardware → sensors topology.
    async fn list_hardware_with_sensors(&self, cancel: &CancellationToken) -> Result<Topology>;

    /// Raw reading per sensor. Sensors that did not report are absent.
    async fn current_sensor_values(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Sensor, f64>>;
}

struct TopologySource(Arc<dyn HardwareInspector>);

#[async_trait]
impl SnapshotSource<Topology> for TopologySource {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Topology> {
        self.0.list_hardware_with_sensors(cancel).await
    }
}

/// Inspector whose topology goes through a [`CoalescingCache`]. Readings
/// always pass through so every cycle stores fresh values.
pub struct CachedInspector {
    inner: Arc<dyn HardwareInspector>,
    topology: CoalescingCache<Topology>,
}

impl CachedInspector {
    pub fn new(
        inner: Arc<dyn HardwareInspector>,
        retention: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        let topology = CoalescingCache::new(
            Arc::new(TopologySource(Arc::clone(&inner))),
            retention,
            fetch_timeout,
        )?;
        Ok(Self { inner, topology })
    }
}

#[async_trait]
impl HardwareInspector for CachedInspector {
    async fn list_hardware_with_sensors(&self, cancel: &CancellationToken) -> Result<Topology> {
        self.topology.get(cancel).await
    }

    async fn current_sensor_values(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Sensor, f64>> {
        self.inner.current_sensor_values(cancel).await
    }
}
