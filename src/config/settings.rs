use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConfigError, Result};
use crate::calibration::DEFAULT_HISTORY_CAPACITY;
use crate::serial::framer::DEFAULT_BOOT_NOISE_PREFIXES;
use crate::serial::protocol::{AcquisitionMode, BAUD_RATE};

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub port_name: Option<String>,
    pub baud_rate: u32,
    /// Logical channel n is hardware channel `offset + n`
    pub hardware_channel_offset: u32,
    pub channel_labels: Vec<String>,
    pub acquisition: AcquisitionMode,
    pub api_base_url: String,
    pub calibration_id: Option<Uuid>,
    /// Per-request limit for calibration API calls
    pub api_timeout_secs: u64,
    pub sample_interval_ms: u64,
    pub history_capacity: usize,
    pub boot_noise_prefixes: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: BAUD_RATE,
            hardware_channel_offset: 28,
            channel_labels: (1..=4).map(|n| format!("T{}", n)).collect(),
            acquisition: AcquisitionMode::default(),
            api_base_url: "http://127.0.0.1:8000".to_string(),
            calibration_id: None,
            api_timeout_secs: 10,
            sample_interval_ms: 500,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            boot_noise_prefixes: DEFAULT_BOOT_NOISE_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid("sample_interval_ms must be > 0".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be > 0".to_string()));
        }
        if self.api_timeout_secs == 0 {
            return Err(ConfigError::Invalid("api_timeout_secs must be > 0".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn hardware_channels(&self) -> Vec<u32> {
        (1..=4).map(|n| self.hardware_channel_offset + n).collect()
    }
}
