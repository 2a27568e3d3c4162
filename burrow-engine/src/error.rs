//! Error types for the tunnel server engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel server
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] burrow_protocol::Error),

    /// TUN device error
    #[error("TUN error: {0}")]
    Tun(#[from] burrow_tun::Error),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
