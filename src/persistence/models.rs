use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationLogEntry;

/// Log row as served by `GET /calibrations/{id}/log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryResponse {
    pub calibration_number: u32,
    pub time: String,
    /// Milliseconds since the epoch, when the server provides it
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub measured_temperature: f64,
    #[serde(rename = "measuredVoltageT1")]
    pub measured_voltage_t1: f64,
    #[serde(rename = "measuredVoltageT2")]
    pub measured_voltage_t2: f64,
    #[serde(rename = "measuredVoltageT3")]
    pub measured_voltage_t3: f64,
    #[serde(rename = "measuredVoltageT4")]
    pub measured_voltage_t4: f64,
}

/// Body of `POST /calibrations/{id}/log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryCreate {
    pub calibration_number: u32,
    pub measured_temperature: f64,
    pub voltage_t1: f64,
    pub voltage_t2: f64,
    pub voltage_t3: f64,
    pub voltage_t4: f64,
    pub time: Option<String>,
}

impl From<&CalibrationLogEntry> for LogEntryCreate {
    fn from(entry: &CalibrationLogEntry) -> Self {
        Self {
            calibration_number: entry.ordinal,
            measured_temperature: entry.reference_temperature_c,
            voltage_t1: entry.raw_values[0],
            voltage_t2: entry.raw_values[1],
            voltage_t3: entry.raw_values[2],
            voltage_t4: entry.raw_values[3],
            // naive ISO form, the server parses it with fromisoformat
            time: Some(entry.timestamp.naive_utc().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
        }
    }
}

impl From<LogEntryResponse> for CalibrationLogEntry {
    fn from(row: LogEntryResponse) -> Self {
        let timestamp = parse_time(&row.time)
            .or_else(|| row.timestamp.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
            .unwrap_or_else(Utc::now);
        Self {
            ordinal: row.calibration_number,
            timestamp,
            reference_temperature_c: row.measured_temperature,
            raw_values: [
                row.measured_voltage_t1,
                row.measured_voltage_t2,
                row.measured_voltage_t3,
                row.measured_voltage_t4,
            ],
        }
    }
}

/// Accepts RFC 3339 or a naive ISO timestamp (taken as UTC).
pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Log append rejected: {0}")]
    Rejected(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
