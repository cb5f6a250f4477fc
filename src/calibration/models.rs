use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::CHANNEL_COUNT;

/// One committed capture: a reference temperature and the raw reading of
/// every channel at that moment (0 for channels that were not captured).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationLogEntry {
    /// 1-based, equals the log length before this entry was appended.
    pub ordinal: u32,
    pub timestamp: DateTime<Utc>,
    pub reference_temperature_c: f64,
    pub raw_values: [f64; CHANNEL_COUNT],
}

impl CalibrationLogEntry {
    pub fn raw_value(&self, channel_index: usize) -> f64 {
        self.raw_values.get(channel_index).copied().unwrap_or(0.0)
    }
}

/// Chart marker recorded for each captured channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub timestamp: DateTime<Utc>,
    /// Converted channel temperature at capture time
    pub temperature_c: f64,
    pub reference_temperature_c: f64,
    pub channel_id: u32,
    pub raw_value: f64,
    pub label: String,
}

/// Everything one capture produces before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub entry: CalibrationLogEntry,
    pub points: Vec<CalibrationPoint>,
    /// Logical ids (1..=4) of the channels that took part
    pub channels: Vec<u8>,
}
