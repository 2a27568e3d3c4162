//! Error types for the burrow wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or decoding tunnel traffic
#[derive(Debug, Error)]
pub enum Error {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid {encoding} character {byte:#04x}")]
    InvalidEncoding { encoding: &'static str, byte: u8 },

    #[error("malformed DNS message: {0}")]
    MalformedDns(String),

    #[error("record type {0} cannot carry tunnel data")]
    UnsupportedRecordType(u16),

    #[error("window full: {needed} fragments needed, {available} slots available")]
    WindowFull { needed: usize, available: usize },

    #[error("fragment payload of {len} bytes exceeds the {max} byte limit")]
    FragmentTooLarge { len: usize, max: usize },
}
