//! Core error type shared by the DES crates.

use thiserror::Error;

use crate::codec::CodecError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Telemetry frame or its text form was malformed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A value failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the current lifecycle phase.
    #[error("Invalid state: {0}")]
    State(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
