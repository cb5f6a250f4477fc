use std::path::Path;

use chrono::SecondsFormat;

use crate::calibration::CalibrationLogEntry;

pub const CSV_HEADER: &str = "Calibration #,Time,Measured Temperature (°C),Resistance T1 (Ω),Resistance T2 (Ω),Resistance T3 (Ω),Resistance T4 (Ω)";

/// One row per log entry; resistance cells are empty for channels that were not captured.
pub fn render_csv(entries: &[CalibrationLogEntry]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + entries.len() * 64);
    out.push_str(CSV_HEADER);
    out.push('\n');

    for entry in entries {
        let mut row = vec![
            entry.ordinal.to_string(),
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            format_value(entry.reference_temperature_c),
        ];
        row.extend(entry.raw_values.iter().map(|v| format_resistance(*v)));
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

pub fn write_csv(path: &Path, entries: &[CalibrationLogEntry]) -> std::io::Result<()> {
    std::fs::write(path, render_csv(entries))?;
    log::info!("Exported {} calibration entries to {}", entries.len(), path.display());
    Ok(())
}

fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{:.2}", value)
    } else {
        String::new()
    }
}

fn format_resistance(value: f64) -> String {
    if value == 0.0 {
        String::new()
    } else {
        format_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::models::parse_time;

    #[test]
    fn test_rows_format_two_decimals_and_blank_zeroes() {
        let entries = vec![CalibrationLogEntry {
            ordinal: 1,
            timestamp: parse_time("2025-02-21T15:30:00Z").unwrap(),
            reference_temperature_c: 60.0,
            raw_values: [3017.3, 0.0, 974.333, f64::NAN],
        }];
        let csv = render_csv(&entries);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "1,2025-02-21T15:30:00Z,60.00,3017.30,,974.33,");
    }

    #[test]
    fn test_empty_log_is_header_only() {
        assert_eq!(render_csv(&[]), format!("{}\n", CSV_HEADER));
    }
}
