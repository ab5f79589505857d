//! Live hardware inspection with sysinfo.
//!
//! Layout of what gets exposed:
//! - `/cpu/0`: total load, per-core load and clock, CPU temperatures
//! - `/ram`: used percent, used and available GB
//! - `/lpc/0`: every other temperature component
//!
//! Temperature sensor ids are derived from component labels
//! (`/cpu/0/temperature/coretemp_package_id_0`), so they survive sysinfo
//! listing components in a different order.

use crate::inspector::HardwareInspector;
use async_trait::async_trait;
use sensor_common::{
    Hardware, HardwareId, HardwareType, Result, Sensor, SensorId, SensorType, TelemetryError,
    Topology,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Components, System};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Component labels that belong to the CPU package
const CPU_THERMAL_MARKERS: &[&str] = &["coretemp", "k10temp", "package", "core", "tctl", "tdie", "cpu"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreReading {
    pub load: f32,
    pub frequency_mhz: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalReading {
    pub label: String,
    pub celsius: f32,
    pub max: f32,
    pub critical: Option<f32>,
}

/// Plain values read from the machine in one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineReadings {
    pub cpu_brand: String,
    pub total_load: f32,
    pub cores: Vec<CoreReading>,
    pub total_memory: u64,
    pub used_memory: u64,
    pub available_memory: u64,
    pub thermal: Vec<ThermalReading>,
}

fn read_machine(system: &mut System) -> MachineReadings {
    system.refresh_cpu();
    system.refresh_memory();

    let cores = system
        .cpus()
        .iter()
        .map(|cpu| CoreReading {
            load: cpu.cpu_usage(),
            frequency_mhz: cpu.frequency(),
        })
        .collect();

    let cpu_brand = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();

    let components = Components::new_with_refreshed_list();
    let thermal = components
        .list()
        .iter()
        .map(|component| ThermalReading {
            label: component.label().to_string(),
            celsius: component.temperature(),
            max: component.max(),
            critical: component.critical(),
        })
        .collect();

    MachineReadings {
        cpu_brand,
        total_load: system.global_cpu_info().cpu_usage(),
        cores,
        total_memory: system.total_memory(),
        used_memory: system.used_memory(),
        available_memory: system.available_memory(),
        thermal,
    }
}

fn is_cpu_thermal(label: &str) -> bool {
    let label = label.to_lowercase();
    CPU_THERMAL_MARKERS.iter().any(|marker| label.contains(marker))
}

/// Stable id fragment for a component label: lowercase ASCII alphanumerics,
/// everything else collapsed to `_`. Components that repeat a label are told
/// apart by their order among components with that label.
fn label_slug(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    slug
}

struct HardwareBuilder {
    hardware: Hardware,
    readings: Vec<(Sensor, f64)>,
    temperature_labels: HashMap<String, usize>,
}

impl HardwareBuilder {
    fn new(id: &str, name: impl Into<String>, kind: HardwareType) -> Self {
        Self {
            hardware: Hardware {
                id: HardwareId::new(id),
                name: name.into(),
                kind,
            },
            readings: Vec::new(),
            temperature_labels: HashMap::new(),
        }
    }

    fn add(&mut self, suffix: String, name: impl Into<String>, kind: SensorType, max_value: i64, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.readings.push((
            Sensor {
                id: SensorId::new(format!("{}/{}", self.hardware.id, suffix)),
                hardware_id: self.hardware.id.clone(),
                name: name.into(),
                kind,
                max_value,
            },
            value,
        ));
    }

    fn add_temperature(&mut self, reading: &ThermalReading) {
        let limit = reading
            .critical
            .filter(|c| c.is_finite() && *c > 0.0)
            .or(Some(reading.max).filter(|m| m.is_finite() && *m > 0.0))
            .map(|t| t.round() as i64)
            .unwrap_or(0);

        let slug = label_slug(&reading.label);
        let seen = self.temperature_labels.entry(slug.clone()).or_insert(0);
        *seen += 1;
        let suffix = match *seen {
            1 => format!("temperature/{}", slug),
            n => format!("temperature/{}_{}", slug, n),
        };
        self.add(suffix, reading.label.clone(), SensorType::Temperature, limit, reading.celsius as f64);
    }

    fn finish(self) -> Option<(Hardware, Vec<(Sensor, f64)>)> {
        if self.readings.is_empty() {
            return None;
        }
        Some((self.hardware, self.readings))
    }
}

/// Turn one pass of readings into hardware with their sensors and values.
/// Non-finite readings are dropped; hardware with no readings is omitted.
pub fn build_inventory(readings: &MachineReadings) -> Vec<(Hardware, Vec<(Sensor, f64)>)> {
    let brand = if readings.cpu_brand.is_empty() {
        "Unknown CPU".to_string()
    } else {
        readings.cpu_brand.clone()
    };

    let mut cpu = HardwareBuilder::new("/cpu/0", brand, HardwareType::Cpu);
    cpu.add("load/0".to_string(), "CPU Total", SensorType::Load, 100, readings.total_load as f64);
    for (i, core) in readings.cores.iter().enumerate() {
        let n = i + 1;
        cpu.add(format!("load/{}", n), format!("CPU Core #{}", n), SensorType::Load, 100, core.load as f64);
        cpu.add(
            format!("clock/{}", n),
            format!("CPU Core #{}", n),
            SensorType::Clock,
            0,
            core.frequency_mhz as f64,
        );
    }

    let mut ram = HardwareBuilder::new("/ram", "Generic Memory", HardwareType::Ram);
    if readings.total_memory > 0 {
        let total_gb = readings.total_memory as f64 / GB;
        let used_pct = readings.used_memory as f64 / readings.total_memory as f64 * 100.0;
        ram.add("load/0".to_string(), "Memory", SensorType::Load, 100, used_pct);
        ram.add(
            "data/0".to_string(),
            "Memory Used",
            SensorType::Data,
            total_gb.round() as i64,
            readings.used_memory as f64 / GB,
        );
        ram.add(
            "data/1".to_string(),
            "Memory Available",
            SensorType::Data,
            total_gb.round() as i64,
            readings.available_memory as f64 / GB,
        );
    }

    let mut board = HardwareBuilder::new("/lpc/0", "Super I/O", HardwareType::SuperIo);
    for reading in &readings.thermal {
        if is_cpu_thermal(&reading.label) {
            cpu.add_temperature(reading);
        } else {
            board.add_temperature(reading);
        }
    }

    [cpu, ram, board]
        .into_iter()
        .filter_map(HardwareBuilder::finish)
        .collect()
}

/// [`HardwareInspector`] over the local machine.
///
/// Keeps one `System` across calls so CPU usage is measured between
/// consecutive polls.
pub struct SysinfoInspector {
    system: Arc<Mutex<System>>,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }

    async fn inventory(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Hardware, Vec<(Sensor, f64)>)>> {
        let system = Arc::clone(&self.system);
        let task = tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            read_machine(&mut system)
        });

        let readings = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TelemetryError::Cancelled),
            joined = task => joined.map_err(|e| TelemetryError::upstream("read hardware", e))?,
        };

        let inventory = build_inventory(&readings);
        debug!(
            hardware = inventory.len(),
            sensors = inventory.iter().map(|(_, s)| s.len()).sum::<usize>(),
            "read hardware"
        );
        Ok(inventory)
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareInspector for SysinfoInspector {
    async fn list_hardware_with_sensors(&self, cancel: &CancellationToken) -> Result<Topology> {
        Ok(self
            .inventory(cancel)
            .await?
            .into_iter()
            .map(|(hardware, readings)| {
                (hardware, readings.into_iter().map(|(sensor, _)| sensor).collect())
            })
            .collect())
    }

    async fn current_sensor_values(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Sensor, f64>> {
        Ok(self
            .inventory(cancel)
            .await?
            .into_iter()
            .flat_map(|(_, readings)| readings)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings() -> MachineReadings {
        MachineReadings {
            cpu_brand: "Test CPU 3000".to_string(),
            total_load: 37.4,
            cores: vec![
                CoreReading { load: 20.0, frequency_mhz: 3400 },
                CoreReading { load: 54.8, frequency_mhz: 3600 },
            ],
            total_memory: 16 * 1024 * 1024 * 1024,
            used_memory: 4 * 1024 * 1024 * 1024,
            available_memory: 12 * 1024 * 1024 * 1024,
            thermal: vec![
                ThermalReading {
                    label: "coretemp Package id 0".to_string(),
                    celsius: 55.5,
                    max: 60.0,
                    critical: Some(100.0),
                },
                ThermalReading {
                    label: "acpitz".to_string(),
                    celsius: 41.0,
                    max: 45.0,
                    critical: None,
                },
                ThermalReading {
                    label: "nvme Composite".to_string(),
                    celsius: f32::NAN,
                    max: 0.0,
                    critical: None,
                },
            ],
        }
    }

    fn find<'a>(
        inventory: &'a [(Hardware, Vec<(Sensor, f64)>)],
        id: &str,
    ) -> Option<&'a (Sensor, f64)> {
        inventory
            .iter()
            .flat_map(|(_, sensors)| sensors)
            .find(|(sensor, _)| sensor.id.as_str() == id)
    }

    #[test]
    fn test_cpu_sensors() {
        let inventory = build_inventory(&readings());
        let (cpu, _) = &inventory[0];
        assert_eq!(cpu.id.as_str(), "/cpu/0");
        assert_eq!(cpu.name, "Test CPU 3000");

        let (total, value) = find(&inventory, "/cpu/0/load/0").unwrap();
        assert_eq!(total.kind, SensorType::Load);
        assert!((value - 37.4).abs() < 0.01);

        let (clock, value) = find(&inventory, "/cpu/0/clock/2").unwrap();
        assert_eq!(clock.kind, SensorType::Clock);
        assert_eq!(*value, 3600.0);

        let (temp, value) = find(&inventory, "/cpu/0/temperature/coretemp_package_id_0").unwrap();
        assert_eq!(temp.max_value, 100);
        assert_eq!(*value, 55.5);
    }

    #[test]
    fn test_memory_sensors() {
        let inventory = build_inventory(&readings());

        let (_, used_pct) = find(&inventory, "/ram/load/0").unwrap();
        assert_eq!(*used_pct, 25.0);

        let (used, value) = find(&inventory, "/ram/data/0").unwrap();
        assert_eq!(used.max_value, 16);
        assert_eq!(*value, 4.0);

        let (_, available) = find(&inventory, "/ram/data/1").unwrap();
        assert_eq!(*available, 12.0);
    }

    #[test]
    fn test_other_thermal_goes_to_super_io() {
        let inventory = build_inventory(&readings());

        let (board, sensors) = inventory
            .iter()
            .find(|(hw, _)| hw.kind == HardwareType::SuperIo)
            .unwrap();
        assert_eq!(board.id.as_str(), "/lpc/0");
        // NaN reading dropped
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].0.max_value, 45);
    }

    #[test]
    fn test_temperature_ids_follow_labels_not_order() {
        let mut first = readings();
        first.thermal.push(ThermalReading {
            label: "acpitz".to_string(),
            celsius: 43.0,
            max: 45.0,
            critical: None,
        });
        let mut reordered = first.clone();
        reordered.thermal.swap(0, 1);

        for inventory in [build_inventory(&first), build_inventory(&reordered)] {
            let (_, value) = find(&inventory, "/cpu/0/temperature/coretemp_package_id_0").unwrap();
            assert_eq!(*value, 55.5);
            let (_, value) = find(&inventory, "/lpc/0/temperature/acpitz").unwrap();
            assert_eq!(*value, 41.0);
            let (_, value) = find(&inventory, "/lpc/0/temperature/acpitz_2").unwrap();
            assert_eq!(*value, 43.0);
        }
    }

    #[test]
    fn test_label_slug() {
        assert_eq!(label_slug("coretemp Package id 0"), "coretemp_package_id_0");
        assert_eq!(label_slug("  nvme: Composite  "), "nvme_composite");
        assert_eq!(label_slug("--"), "unnamed");
    }

    #[test]
    fn test_empty_readings() {
        let inventory = build_inventory(&MachineReadings::default());
        // Only the total CPU load survives
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].0.name, "Unknown CPU");
    }

    #[tokio::test]
    async fn test_live_inspector_reports_memory() {
        let inspector = SysinfoInspector::new();
        let cancel = CancellationToken::new();

        let topology = inspector.list_hardware_with_sensors(&cancel).await.unwrap();
        assert!(topology.keys().any(|hw| hw.kind == HardwareType::Ram));

        let values = inspector.current_sensor_values(&cancel).await.unwrap();
        assert!(values.keys().any(|s| s.id.as_str() == "/ram/load/0"));
    }
}
