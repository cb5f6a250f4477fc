use super::types::{ParsedLine, Readings};

/// Parse a telemetry line.
/// Format: `<channelId>:<value>;<channelId>:<value>;...`
///
/// Malformed tokens are skipped individually; the rest of the line is kept.
/// Channel ids are not checked against the configured channels.
pub fn parse_line(line: &str) -> ParsedLine {
    let mut parsed = ParsedLine::default();

    for token in line.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match parse_token(token) {
            Some((channel, value)) => {
                parsed.readings.insert(channel, value);
            }
            None => {
                log::debug!("Skipping malformed telemetry token: {:?}", token);
                parsed.skipped_tokens += 1;
            }
        }
    }

    parsed
}

/// Parse a line and keep only the readings
pub fn parse_readings(line: &str) -> Readings {
    parse_line(line).readings
}

fn parse_token(token: &str) -> Option<(u32, f64)> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let channel = parts[0].trim().parse::<u32>().ok()?;
    let value = parts[1].trim().parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some((channel, value))
}
