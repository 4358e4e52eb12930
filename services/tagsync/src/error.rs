//! Service error types

use crate::device::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Store error: {0}")]
    Store(#[from] tagsync_libs::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Persistence(err.to_string())
    }
}
