pub mod capture;
pub mod coefficients;
pub mod history;
pub mod models;
pub mod solver;

pub use capture::{CaptureController, CaptureError, CaptureStart, CaptureTimer, SAMPLE_INTERVAL};
pub use coefficients::{CalibrationCoefficients, CoefficientTable, KELVIN_OFFSET};
pub use history::{BoundedBuffer, CalibrationHistory, DEFAULT_HISTORY_CAPACITY};
pub use models::{CalibrationLogEntry, CalibrationPoint, CaptureRecord};
pub use solver::{fit, refit_channel, select_points, PointSource, SolverError, STANDARD_POINTS};
