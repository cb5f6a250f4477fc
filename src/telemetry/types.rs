use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hardware channel id → raw reading, as parsed from one telemetry line.
pub type Readings = BTreeMap<u32, f64>;

/// Result of parsing one telemetry line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub readings: Readings,
    /// Non-empty tokens that were not `<id>:<value>` pairs
    pub skipped_tokens: usize,
}

/// One point of the live telemetry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    /// Converted temperature per logical channel; `None` when inactive or unavailable
    pub temperatures: [Option<f64>; 4],
}
