//! Data model shared by adapters, the delta buffer, storage and the classifier.
//!
//! Adapters produce [`MetricReading`]s. The collector folds them into a
//! [`Snapshot`] through [`Measurement`], which is the only place where a
//! reading's availability is inspected. Everything downstream works with
//! plain [`Value`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A metric value: a number or a short text label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    /// Returns the numeric payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(_) => None,
        }
    }

    /// Returns `true` for numbers that are neither NaN nor infinite, and for text.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Number(n) => n.is_finite(),
            Value::Text(_) => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Rounds to two decimal places, the precision metrics are stored with.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One named, unit-tagged reading produced by an adapter during a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReading {
    pub name: String,
    pub value: Value,
    pub unit: String,
    /// Adapter that produced the reading (`cpu`, `nvidia`, ...).
    pub source: String,
    pub available: bool,
    pub error: Option<String>,
}

impl MetricReading {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<Value>,
        unit: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            unit: unit.into(),
            source: source.into(),
            available: true,
            error: None,
        }
    }

    /// A reading whose sensor exists but could not be read this tick.
    pub fn unavailable(
        name: impl Into<String>,
        unit: impl Into<String>,
        source: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: Value::Number(0.0),
            unit: unit.into(),
            source: source.into(),
            available: false,
            error: Some(error.into()),
        }
    }
}

/// Readings of one adapter for one tick, keyed by metric name.
pub type Readings = BTreeMap<String, MetricReading>;

/// Identity of the physical source behind an adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    pub vendor: String,
    pub model: String,
    pub identifier: String,
    pub driver_version: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Input to [`Snapshot::insert`]: either a bare number or an adapter reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Raw(f64),
    Tagged(MetricReading),
}

impl Measurement {
    /// Resolves to the stored value. Unavailable readings and non-finite
    /// numbers resolve to `None` and are never stored.
    pub fn resolve(self) -> Option<Value> {
        let value = match self {
            Measurement::Raw(n) => Value::Number(n),
            Measurement::Tagged(reading) if reading.available => reading.value,
            Measurement::Tagged(_) => return None,
        };
        value.is_finite().then_some(value)
    }
}

impl From<f64> for Measurement {
    fn from(v: f64) -> Self {
        Measurement::Raw(v)
    }
}

impl From<MetricReading> for Measurement {
    fn from(r: MetricReading) -> Self {
        Measurement::Tagged(r)
    }
}

/// All adapters' readings for one tick, tagged with time and device.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub values: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            device_id: device_id.into(),
            values: BTreeMap::new(),
        }
    }

    /// Stores a measurement under `key`. Returns `false` if it resolved to nothing.
    pub fn insert(&mut self, key: impl Into<String>, measurement: impl Into<Measurement>) -> bool {
        match measurement.into().resolve() {
            Some(value) => {
                self.values.insert(key.into(), value);
                true
            }
            None => false,
        }
    }

    /// Stores a text label (e.g. the current session category).
    pub fn set_label(&mut self, key: impl Into<String>, label: impl Into<String>) {
        self.values.insert(key.into(), Value::Text(label.into()));
    }

    /// Merges one adapter's readings into the snapshot.
    pub fn merge(&mut self, readings: Readings) {
        for (key, reading) in readings {
            self.insert(key, reading);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Iterates over numeric fields only.
    pub fn numeric_fields(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.as_str(), n)))
    }

    /// ISO-8601 UTC rendering used in the tabular files.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Fixed set of hardware categories, one tabular file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareType {
    Cpu,
    GpuNvidia,
    GpuIntel,
    Memory,
    Disk,
    Network,
}

impl HardwareType {
    pub const ALL: [HardwareType; 6] = [
        HardwareType::Cpu,
        HardwareType::GpuNvidia,
        HardwareType::GpuIntel,
        HardwareType::Memory,
        HardwareType::Disk,
        HardwareType::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareType::Cpu => "cpu",
            HardwareType::GpuNvidia => "gpu_nvidia",
            HardwareType::GpuIntel => "gpu_intel",
            HardwareType::Memory => "memory",
            HardwareType::Disk => "disk",
            HardwareType::Network => "network",
        }
    }

    /// Name of the local and remote file for this type.
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HardwareType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown hardware type '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_drops_unavailable_and_non_finite() {
        let mut snap = Snapshot::new("dev", Utc::now());
        assert!(snap.insert("a", 1.5));
        assert!(!snap.insert("nan", f64::NAN));
        assert!(!snap.insert("inf", f64::INFINITY));
        assert!(!snap.insert(
            "temp",
            MetricReading::unavailable("temp", "C", "cpu", "sensor missing")
        ));
        assert!(snap.insert("name", MetricReading::new("name", "Arc A770", "", "intel")));

        assert_eq!(snap.number("a"), Some(1.5));
        assert!(snap.get("nan").is_none());
        assert!(snap.get("temp").is_none());
        assert_eq!(snap.get("name"), Some(&Value::Text("Arc A770".into())));
    }

    #[test]
    fn test_numeric_fields_skip_labels() {
        let mut snap = Snapshot::new("dev", Utc::now());
        snap.insert("x", 1.0);
        snap.set_label("session_category", "gaming");
        let fields: Vec<_> = snap.numeric_fields().collect();
        assert_eq!(fields, vec![("x", 1.0)]);
    }

    #[test]
    fn test_hardware_type_round_trip_names() {
        for t in HardwareType::ALL {
            assert_eq!(t.as_str().parse::<HardwareType>().unwrap(), t);
        }
        assert_eq!(HardwareType::GpuNvidia.file_name(), "gpu_nvidia.csv");
        assert!("gpu".parse::<HardwareType>().is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Number(50.0).to_string(), "50");
        assert_eq!(Value::Number(12.25).to_string(), "12.25");
        assert_eq!(Value::from("idle").to_string(), "idle");
    }
}
