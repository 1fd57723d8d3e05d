//! Error type for device and job operations.

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, DesError>;

#[derive(Debug, Error)]
pub enum DesError {
    /// No connected device with this serial.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already registered: {0}")]
    AlreadyRegistered(String),

    /// The request does not fit the device's lifecycle phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The caller's role does not allow the request.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] des_storage::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed inbound payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] des_core::Error),
}

impl From<des_core::CodecError> for DesError {
    fn from(e: des_core::CodecError) -> Self {
        DesError::Protocol(e.to_string())
    }
}

impl From<serde_json::Error> for DesError {
    fn from(e: serde_json::Error) -> Self {
        DesError::Protocol(e.to_string())
    }
}
