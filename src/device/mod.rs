pub mod channels;

pub use channels::{ChannelState, ChannelStore, CHANNEL_COUNT};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(u8),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
