//! Hardware and sensor data model.
//!
//! Identifiers are opaque strings assigned by whatever inspects the hardware
//! (for the sysinfo inspector: `/cpu/0`, `/cpu/0/load/1`, `/ram/data/0`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(SensorId);
string_id!(HardwareId);

/// One reading of one sensor. Immutable once stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: i64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Raw readings are rounded to the nearest integer before storage.
    pub fn from_reading(raw: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: raw.round() as i64,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareType {
    Unknown,
    Motherboard,
    SuperIo,
    Cpu,
    Gpu,
    TBalancer,
    HeatMaster,
    Hdd,
    Ram,
    Network,
    Memory,
    Storage,
    Battery,
}

impl HardwareType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Motherboard => "motherboard",
            Self::SuperIo => "super_io",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::TBalancer => "t_balancer",
            Self::HeatMaster => "heat_master",
            Self::Hdd => "hdd",
            Self::Ram => "ram",
            Self::Network => "network",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Battery => "battery",
        }
    }
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Unknown,
    Voltage,
    Clock,
    Temperature,
    Load,
    Fan,
    Flow,
    Control,
    Level,
    Power,
    SmallData,
    Throughput,
    Data,
    Factor,
    Energy,
    Current,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Voltage => "voltage",
            Self::Clock => "clock",
            Self::Temperature => "temperature",
            Self::Load => "load",
            Self::Fan => "fan",
            Self::Flow => "flow",
            Self::Control => "control",
            Self::Level => "level",
            Self::Power => "power",
            Self::SmallData => "small_data",
            Self::Throughput => "throughput",
            Self::Data => "data",
            Self::Factor => "factor",
            Self::Energy => "energy",
            Self::Current => "current",
        }
    }

    /// Unit the readings of this sensor type are expressed in
    pub fn unit(&self) -> Unit {
        match self {
            Self::Voltage => Unit::Volt,
            Self::Clock => Unit::Megahertz,
            Self::Temperature => Unit::Celsius,
            Self::Load | Self::Control | Self::Level => Unit::Percentage,
            Self::Fan => Unit::RevolutionsPerMinute,
            Self::Flow => Unit::LitersPerHour,
            Self::Power => Unit::Watts,
            Self::SmallData => Unit::Megabytes,
            Self::Throughput => Unit::KilobytesPerSecond,
            Self::Data => Unit::Gigabytes,
            Self::Energy => Unit::MilliwattHours,
            Self::Current => Unit::Amperes,
            Self::Factor | Self::Unknown => Unit::Unknown,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Unknown,
    Volt,
    Megahertz,
    Celsius,
    Percentage,
    RevolutionsPerMinute,
    LitersPerHour,
    Watts,
    Gigabytes,
    Megabytes,
    KilobytesPerSecond,
    MilliwattHours,
    Amperes,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::Volt => "V",
            Self::Megahertz => "MHz",
            Self::Celsius => "°C",
            Self::Percentage => "%",
            Self::RevolutionsPerMinute => "RPM",
            Self::LitersPerHour => "L/h",
            Self::Watts => "W",
            Self::Gigabytes => "GB",
            Self::Megabytes => "MB",
            Self::KilobytesPerSecond => "KB/s",
            Self::MilliwattHours => "mWh",
            Self::Amperes => "A",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hardware {
    pub id: HardwareId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: HardwareType,
}

/// A sensor's attributes are fetched fresh on every cycle; they are not
/// versioned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub hardware_id: HardwareId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SensorType,
    pub max_value: i64,
}

/// Hardware to the sensors it carries.
pub type Topology = HashMap<Hardware, Vec<Sensor>>;

/// Current readings for every sensor that reported a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub hardware: Vec<HardwareReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareReading {
    pub hardware: Hardware,
    pub sensors: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor: Sensor,
    pub value: Sample,
}

impl StatsSnapshot {
    /// Join a topology with current values. Values are matched on sensor id,
    /// sensors without a value are left out, and hardware and sensors are
    /// ordered by id.
    pub fn build(topology: &Topology, values: &HashMap<Sensor, f64>, taken_at: DateTime<Utc>) -> Self {
        let by_id: HashMap<&SensorId, f64> =
            values.iter().map(|(sensor, raw)| (&sensor.id, *raw)).collect();

        let mut hardware: Vec<HardwareReading> = topology
            .iter()
            .map(|(hw, sensors)| {
                let mut readings: Vec<SensorReading> = sensors
                    .iter()
                    .filter_map(|sensor| {
                        by_id.get(&sensor.id).map(|raw| SensorReading {
                            sensor: sensor.clone(),
                            value: Sample::from_reading(*raw, taken_at),
                        })
                    })
                    .collect();
                readings.sort_by(|a, b| a.sensor.id.cmp(&b.sensor.id));

                HardwareReading {
                    hardware: hw.clone(),
                    sensors: readings,
                }
            })
            .collect();
        hardware.sort_by(|a, b| a.hardware.id.cmp(&b.hardware.id));

        Self { taken_at, hardware }
    }

    pub fn sensor_count(&self) -> usize {
        self.hardware.iter().map(|hw| hw.sensors.len()).sum()
    }
}

/// Stored history over `[from, to]`, per hardware, per sensor type, per sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub generated_at: DateTime<Utc>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub hardware: Vec<HardwareHistory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareHistory {
    pub hardware: Hardware,
    pub sensors: BTreeMap<SensorType, Vec<SensorHistory>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorHistory {
    pub sensor: Sensor,
    pub samples: Vec<Sample>,
}

impl StatsReport {
    pub fn find(&self, sensor: &SensorId) -> Option<&SensorHistory> {
        self.hardware
            .iter()
            .flat_map(|hw| hw.sensors.values())
            .flatten()
            .find(|history| &history.sensor.id == sensor)
    }
}
