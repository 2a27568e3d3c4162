//! Error types for TUN device management

use thiserror::Error;

/// Result type alias for TUN operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or configuring a TUN device
#[derive(Debug, Error)]
pub enum Error {
    #[error("TUN support unavailable: {0}")]
    Unavailable(String),

    #[error("device creation failed: {0}")]
    DeviceCreation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
