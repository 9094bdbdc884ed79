use thiserror::Error;

/// Errors that can occur in the control-node library
#[derive(Error, Debug)]
pub enum ControlError {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics-store query error
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// SDN controller communication error
    #[error("SDN controller error: {0}")]
    Sdn(String),

    /// Traffic or path predictor error
    #[error("Predictor error: {0}")]
    Predictor(String),

    /// Virtualization host command error
    #[error("Power command error: {0}")]
    Power(String),

    /// Artefact publication error (local write or remote copy)
    #[error("Publish error: {0}")]
    Publish(String),

    /// Filesystem I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state transition requested
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using ControlError
pub type Result<T> = std::result::Result<T, ControlError>;

impl From<String> for ControlError {
    fn from(s: String) -> Self {
        ControlError::Other(s)
    }
}

impl From<&str> for ControlError {
    fn from(s: &str) -> Self {
        ControlError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Serialization(err.to_string())
    }
}
