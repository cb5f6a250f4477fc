//! Fits the inverse-polynomial model to four reference points.

use super::coefficients::{CalibrationCoefficients, KELVIN_OFFSET};
use super::models::CalibrationLogEntry;

/// Pivots smaller than this abort the fit.
pub const PIVOT_EPSILON: f64 = 1e-12;

/// Number of points needed to determine A, B, C and D.
pub const FIT_POINTS: usize = 4;

/// Factory reference table: (resistance Ω, temperature °C).
pub const STANDARD_POINTS: [(f64, f64); FIT_POINTS] = [
    (3017.3, 60.0),
    (1265.1, 90.0),
    (974.3, 100.0),
    (533.8, 125.0),
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    #[error("Singular matrix: pivot {pivot:e} at column {column}")]
    SingularMatrix { column: usize, pivot: f64 },

    #[error("Fit produced non-finite coefficients")]
    NonFinite,
}

/// Fit coefficients from `(resistance Ω, temperature K)` pairs.
pub fn fit(points: &[(f64, f64); FIT_POINTS]) -> Result<CalibrationCoefficients, SolverError> {
    let mut matrix = [[0.0f64; FIT_POINTS]; FIT_POINTS];
    let mut rhs = [0.0f64; FIT_POINTS];

    for (row, (resistance, kelvin)) in points.iter().enumerate() {
        let ln_r = resistance.ln();
        matrix[row] = [1.0, ln_r, ln_r * ln_r, ln_r * ln_r * ln_r];
        rhs[row] = 1.0 / kelvin;
    }

    let x = solve(matrix, rhs)?;
    let coeffs = CalibrationCoefficients::new(x[0], x[1], x[2], x[3]);
    if !coeffs.is_finite() {
        return Err(SolverError::NonFinite);
    }
    Ok(coeffs)
}

/// Same as [`fit`] with temperatures given in °C.
pub fn fit_celsius(points: &[(f64, f64); FIT_POINTS]) -> Result<CalibrationCoefficients, SolverError> {
    let mut kelvin = *points;
    for point in kelvin.iter_mut() {
        point.1 += KELVIN_OFFSET;
    }
    fit(&kelvin)
}

/// Gaussian elimination with partial pivoting, then back substitution.
fn solve(
    mut a: [[f64; FIT_POINTS]; FIT_POINTS],
    mut b: [f64; FIT_POINTS],
) -> Result<[f64; FIT_POINTS], SolverError> {
    let n = FIT_POINTS;

    for col in 0..n {
        let mut pivot_row = col;
        for row in (col + 1)..n {
            if a[row][col].abs() > a[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        let pivot = a[pivot_row][col];
        if !(pivot.abs() >= PIVOT_EPSILON) {
            return Err(SolverError::SingularMatrix { column: col, pivot });
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; FIT_POINTS];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

/// Which points a refit used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointSource {
    /// The four most recent log entries with a reading on the channel.
    History,
    /// Fewer than four such entries: the factory table.
    Standard,
}

/// Pick the fit input for one channel (index 0..4) as `(Ω, K)` pairs.
///
/// Real and standard points are never mixed.
pub fn select_points(
    entries: &[CalibrationLogEntry],
    channel_index: usize,
) -> ([(f64, f64); FIT_POINTS], PointSource) {
    let recent: Vec<(f64, f64)> = entries
        .iter()
        .rev()
        .filter_map(|entry| {
            let raw = entry.raw_value(channel_index);
            (raw != 0.0 && raw.is_finite())
                .then(|| (raw, entry.reference_temperature_c + KELVIN_OFFSET))
        })
        .take(FIT_POINTS)
        .collect();

    if recent.len() < FIT_POINTS {
        let mut standard = STANDARD_POINTS;
        for point in standard.iter_mut() {
            point.1 += KELVIN_OFFSET;
        }
        return (standard, PointSource::Standard);
    }

    let mut points = [(0.0, 0.0); FIT_POINTS];
    // oldest first, matching log order
    for (slot, point) in points.iter_mut().zip(recent.into_iter().rev()) {
        *slot = point;
    }
    (points, PointSource::History)
}

/// Select points for a channel and fit them.
pub fn refit_channel(
    entries: &[CalibrationLogEntry],
    channel_index: usize,
) -> Result<(CalibrationCoefficients, PointSource), SolverError> {
    let (points, source) = select_points(entries, channel_index);
    fit(&points).map(|coeffs| (coeffs, source))
}
