pub mod models;
pub mod store;

pub use models::{LogEntryCreate, LogEntryResponse, PersistenceError, PersistenceResult};
pub use store::{CalibrationStore, HttpCalibrationStore, MemoryCalibrationStore, DEFAULT_REQUEST_TIMEOUT};
