//! Error types for the broadcast engine

use crate::recovery::ErrorKind;

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in broadcast engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error (not connected, send failure, terminal reconnect failure)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// No engine session exists for the peer
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Offer/answer negotiation failed inside the RTC engine
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// ICE candidate could not be parsed or applied
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Local media source could not be attached or released
    #[error("Media source error: {0}")]
    MediaSourceError(String),

    /// RTC engine failure outside negotiation (session creation, stats, close)
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Recovery could not be performed
    #[error("Recovery error: {0}")]
    RecoveryError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Classify this error for the recovery manager
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SignalingError(_) | Error::WebSocketError(_) => ErrorKind::SignalingError,
            Error::SessionNotFound(_)
            | Error::NegotiationError(_)
            | Error::IceCandidateError(_)
            | Error::EngineError(_)
            | Error::OperationTimeout(_) => ErrorKind::ConnectionFailed,
            Error::MediaSourceError(_) => ErrorKind::CaptureError,
            _ => ErrorKind::Unknown,
        }
    }
}
