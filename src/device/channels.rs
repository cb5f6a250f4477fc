use serde::{Deserialize, Serialize};

use super::{DeviceError, Result};
use crate::calibration::CoefficientTable;
use crate::telemetry::Readings;

pub const CHANNEL_COUNT: usize = 4;

/// Live state of one logical probe channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    /// 1..=4
    pub logical_id: u8,
    pub hardware_channel: u32,
    /// Last raw resistance in ohms; NaN when the last line had no reading
    pub raw_value: f64,
    /// NaN when unavailable
    pub temperature_c: f64,
    pub active: bool,
    pub label: String,
}

impl ChannelState {
    pub fn has_reading(&self) -> bool {
        self.raw_value.is_finite() && self.raw_value != 0.0
    }
}

/// The four channels, updated in one step per telemetry line.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    channels: Vec<ChannelState>,
}

impl ChannelStore {
    pub fn new(hardware_offset: u32, labels: &[String]) -> Self {
        let channels = (1..=CHANNEL_COUNT as u8)
            .map(|logical_id| ChannelState {
                logical_id,
                hardware_channel: hardware_offset + logical_id as u32,
                raw_value: 0.0,
                temperature_c: f64::NAN,
                active: true,
                label: labels
                    .get(logical_id as usize - 1)
                    .cloned()
                    .unwrap_or_else(|| format!("T{}", logical_id)),
            })
            .collect();
        Self { channels }
    }

    /// Apply one parsed line to every active channel.
    ///
    /// An active channel missing from the line loses its reading instead of
    /// keeping the stale one. Inactive channels are left frozen. Returns the
    /// number of channels that received a value.
    pub fn apply(&mut self, readings: &Readings, coefficients: &CoefficientTable) -> usize {
        let mut updated = 0;
        for channel in self.channels.iter_mut().filter(|c| c.active) {
            match readings.get(&channel.hardware_channel) {
                Some(&raw) => {
                    channel.raw_value = raw;
                    channel.temperature_c = coefficients.convert(channel.hardware_channel, raw);
                    updated += 1;
                }
                None => {
                    channel.raw_value = f64::NAN;
                    channel.temperature_c = f64::NAN;
                }
            }
        }
        updated
    }

    /// Recompute temperatures after coefficients changed.
    pub fn recompute(&mut self, coefficients: &CoefficientTable) {
        for channel in self.channels.iter_mut() {
            channel.temperature_c = coefficients.convert(channel.hardware_channel, channel.raw_value);
        }
    }

    /// Returns whether the flag actually changed.
    pub fn set_active(&mut self, logical_id: u8, active: bool) -> Result<bool> {
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.logical_id == logical_id)
            .ok_or(DeviceError::UnknownChannel(logical_id))?;
        let changed = channel.active != active;
        channel.active = active;
        Ok(changed)
    }

    pub fn active_hardware_channels(&self) -> Vec<u32> {
        self.channels
            .iter()
            .filter(|c| c.active)
            .map(|c| c.hardware_channel)
            .collect()
    }

    pub fn hardware_channels(&self) -> Vec<u32> {
        self.channels.iter().map(|c| c.hardware_channel).collect()
    }

    pub fn any_active(&self) -> bool {
        self.channels.iter().any(|c| c.active)
    }

    pub fn get(&self, logical_id: u8) -> Option<&ChannelState> {
        self.channels.iter().find(|c| c.logical_id == logical_id)
    }

    pub fn channels(&self) -> &[ChannelState] {
        &self.channels
    }

    /// Temperatures of active channels, for the telemetry history.
    pub fn temperatures(&self) -> [Option<f64>; CHANNEL_COUNT] {
        let mut out = [None; CHANNEL_COUNT];
        for (slot, channel) in out.iter_mut().zip(self.channels.iter()) {
            if channel.active && channel.temperature_c.is_finite() {
                *slot = Some(channel.temperature_c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::parse_readings;

    fn store() -> ChannelStore {
        ChannelStore::new(28, &[])
    }

    #[test]
    fn test_channels_map_to_hardware_ids() {
        let store = store();
        assert_eq!(store.hardware_channels(), vec![29, 30, 31, 32]);
        assert_eq!(store.get(3).map(|c| c.label.as_str()), Some("T3"));
    }

    #[test]
    fn test_apply_uses_newly_parsed_value() {
        let mut store = store();
        let table = CoefficientTable::new();
        store.apply(&parse_readings("29:3017.3;30:1265.1;31:974.3;32:533.8"), &table);
        store.apply(&parse_readings("29:1265.1;30:1265.1;31:974.3;32:533.8"), &table);
        let ch1 = store.get(1).unwrap();
        assert_eq!(ch1.raw_value, 1265.1);
        assert!((ch1.temperature_c - 90.0).abs() < 0.2);
    }

    #[test]
    fn test_missing_reading_marks_channel_unavailable() {
        let mut store = store();
        let table = CoefficientTable::new();
        store.apply(&parse_readings("29:3017.3;30:1265.1"), &table);
        let updated = store.apply(&parse_readings("29:3017.3"), &table);
        assert_eq!(updated, 1);
        assert!(store.get(2).unwrap().temperature_c.is_nan());
        assert!(!store.get(2).unwrap().has_reading());
    }

    #[test]
    fn test_inactive_channel_is_frozen() {
        let mut store = store();
        let table = CoefficientTable::new();
        store.apply(&parse_readings("29:1000;30:2000"), &table);
        assert!(store.set_active(2, false).unwrap());
        store.apply(&parse_readings("29:1100;30:2500"), &table);
        assert_eq!(store.get(2).unwrap().raw_value, 2000.0);
        assert_eq!(store.active_hardware_channels(), vec![29, 31, 32]);
        assert!(!store.set_active(2, false).unwrap());
        assert!(store.set_active(9, true).is_err());
    }
}
