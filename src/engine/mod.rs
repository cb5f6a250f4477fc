pub mod runner;
pub mod types;

pub use runner::{ProbeEngineBuilder, ProbeHandle};
pub use types::*;

use crate::calibration::CaptureError;
use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::persistence::PersistenceError;
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] SerialError),

    #[error("Invalid capture request: {0}")]
    Validation(#[from] CaptureError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine is not running")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
