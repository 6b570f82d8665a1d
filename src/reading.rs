//! Measurement tuples handed off to the storage layer
//!
//! The drivers themselves return typed values; this module shapes them into
//! plain (sensor, value, timestamp) records the persistence side consumes.

use std::fmt;
use std::time::SystemTime;

/// Logical sensor a reading originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Voltage,
    Temperature,
    Pressure,
    Humidity,
    Eco2,
    Tvoc,
    Light,
}

impl SensorKind {
    /// Measurement unit, used for display and by the storage schema
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Voltage => "V",
            SensorKind::Temperature => "C",
            SensorKind::Pressure => "hPa",
            SensorKind::Humidity => "%",
            SensorKind::Eco2 => "ppm",
            SensorKind::Tvoc => "ppb",
            SensorKind::Light => "ohm",
        }
    }
}

/// A single timestamped measurement
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub kind: SensorKind,
    pub value: f64,
    pub timestamp: SystemTime,
}

impl Reading {
    /// Create a reading stamped with the current time
    pub fn now(kind: SensorKind, value: f64) -> Self {
        Reading {
            kind,
            value,
            timestamp: SystemTime::now(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?}: {:.3} {}",
            humantime::format_rfc3339_seconds(self.timestamp),
            self.kind,
            self.value,
            self.kind.unit()
        )
    }
}
