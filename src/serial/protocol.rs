use serde::{Deserialize, Serialize};

pub const BAUD_RATE: u32 = 115200;

/// Acquisition flags sent with the start command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionMode {
    pub read_time_ms: u32,
    pub switch_delay_ms: u32,
    pub temp_mode: u8,
    pub pt100: bool,
}

impl Default for AcquisitionMode {
    fn default() -> Self {
        Self {
            read_time_ms: 1000,
            switch_delay_ms: 100,
            temp_mode: 0,
            pt100: false,
        }
    }
}

/// Text commands understood by the probe firmware.
///
/// The firmware accepts a single line per command: a comma separated list of
/// hardware channel ids, then `;` separated numeric flags.
pub struct ProbeProtocol;

impl ProbeProtocol {
    /// `c1,c2,c3,c4;readTime,switchDelay,tempMode,pt100Flag\n`
    pub fn start_command(channels: &[u32], mode: &AcquisitionMode) -> String {
        format!(
            "{};{},{},{},{}\n",
            join_ids(channels),
            mode.read_time_ms,
            mode.switch_delay_ms,
            mode.temp_mode,
            u8::from(mode.pt100)
        )
    }

    /// Sent whenever the set of active channels changes.
    pub fn toggle_command(active_channels: &[u32]) -> String {
        format!("{};1;1\n", join_ids(active_channels))
    }
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_format() {
        let mode = AcquisitionMode { read_time_ms: 500, switch_delay_ms: 20, temp_mode: 1, pt100: true };
        assert_eq!(ProbeProtocol::start_command(&[29, 30, 31, 32], &mode), "29,30,31,32;500,20,1,1\n");
    }

    #[test]
    fn test_toggle_command_lists_active_channels() {
        assert_eq!(ProbeProtocol::toggle_command(&[29, 31]), "29,31;1;1\n");
        assert_eq!(ProbeProtocol::toggle_command(&[]), ";1;1\n");
    }
}
