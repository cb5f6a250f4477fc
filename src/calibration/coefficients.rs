use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const KELVIN_OFFSET: f64 = 273.15;

/// Inverse-polynomial (Steinhart-Hart style) model coefficients.
///
/// `1/T[K] = A + B·ln(R) + C·ln(R)² + D·ln(R)³`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCoefficients {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "C")]
    pub c: f64,
    #[serde(rename = "D")]
    pub d: f64,
}

impl CalibrationCoefficients {
    /// Factory coefficient set used until a channel has been refit.
    pub const DEFAULT: Self = Self {
        a: 0.00095373842882,
        b: 0.00021617543909,
        c: 5.623922283161e-06,
        d: -8.684159121295e-08,
    };

    pub const fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { a, b, c, d }
    }

    /// Convert a resistance in ohms to °C.
    ///
    /// Returns NaN when the reading is not positive or the model has no
    /// finite solution for it.
    pub fn to_celsius(&self, resistance: f64) -> f64 {
        if !(resistance > 0.0) {
            return f64::NAN;
        }
        let ln_r = resistance.ln();
        let inv_t = self.a + self.b * ln_r + self.c * ln_r.powi(2) + self.d * ln_r.powi(3);
        let celsius = 1.0 / inv_t - KELVIN_OFFSET;
        if celsius.is_finite() {
            celsius
        } else {
            f64::NAN
        }
    }

    pub fn is_finite(&self) -> bool {
        self.a.is_finite() && self.b.is_finite() && self.c.is_finite() && self.d.is_finite()
    }
}

impl Default for CalibrationCoefficients {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Current coefficients per hardware channel.
///
/// Entries are only ever replaced whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoefficientTable {
    channels: BTreeMap<u32, CalibrationCoefficients>,
}

impl CoefficientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coefficients for `hardware_channel`, falling back to the factory set.
    pub fn get(&self, hardware_channel: u32) -> CalibrationCoefficients {
        self.channels.get(&hardware_channel).copied().unwrap_or_default()
    }

    pub fn replace(&mut self, hardware_channel: u32, coefficients: CalibrationCoefficients) {
        self.channels.insert(hardware_channel, coefficients);
    }

    pub fn contains(&self, hardware_channel: u32) -> bool {
        self.channels.contains_key(&hardware_channel)
    }

    pub fn convert(&self, hardware_channel: u32, resistance: f64) -> f64 {
        self.get(hardware_channel).to_celsius(resistance)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &CalibrationCoefficients)> {
        self.channels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_coefficients_track_reference_points() {
        let coeffs = CalibrationCoefficients::DEFAULT;
        let expected = [(3017.3, 60.0), (1265.1, 90.0), (974.3, 100.0), (533.8, 125.0)];
        for (r, t) in expected {
            let c = coeffs.to_celsius(r);
            assert!((c - t).abs() < 0.1, "R={} gave {} expected {}", r, c, t);
        }
    }

    #[test]
    fn test_non_positive_resistance_is_nan() {
        let coeffs = CalibrationCoefficients::DEFAULT;
        assert!(coeffs.to_celsius(0.0).is_nan());
        assert!(coeffs.to_celsius(-12.0).is_nan());
        assert!(coeffs.to_celsius(f64::NAN).is_nan());
    }

    #[test]
    fn test_table_falls_back_to_default() {
        let mut table = CoefficientTable::new();
        assert_eq!(table.get(29), CalibrationCoefficients::DEFAULT);
        let custom = CalibrationCoefficients::new(1e-3, 2e-4, 0.0, 0.0);
        table.replace(29, custom);
        assert_eq!(table.get(29), custom);
        assert_eq!(table.get(30), CalibrationCoefficients::DEFAULT);
    }
}
