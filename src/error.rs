use serde::Serialize;
use thiserror::Error;

/// Failure categories surfaced to callers of the device drivers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A client-side precondition failed, nothing was sent
    Validation,
    /// The request could not be completed
    Transport,
    /// A response arrived but cannot be used yet (or at all)
    Protocol,
    /// The device answered with an error status
    Server,
    /// Another operation is already in flight on the same instance
    Busy,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{0}")]
    Validation(String),

    #[error("connection error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("{0}")]
    Busy(&'static str),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Validation(_) => ErrorKind::Validation,
            DeviceError::Transport(_) => ErrorKind::Transport,
            DeviceError::Protocol(_) => ErrorKind::Protocol,
            DeviceError::Server { .. } => ErrorKind::Server,
            DeviceError::Busy(_) => ErrorKind::Busy,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DeviceError::Validation(message.into())
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        // a body that fails to decode still means the exchange went wrong
        if e.is_decode() {
            DeviceError::Protocol(e.to_string())
        } else {
            DeviceError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(e: serde_json::Error) -> Self {
        DeviceError::Protocol(format!("failed to parse response: {e}"))
    }
}

impl From<serde_valid::validation::Errors> for DeviceError {
    fn from(e: serde_valid::validation::Errors) -> Self {
        DeviceError::Validation(e.to_string())
    }
}

/// Result type of all device operations
pub type Result<T> = std::result::Result<T, DeviceError>;
