use thiserror::Error;

/// Broker error types
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Network or channel failure while talking to the broker
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The user handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// API misuse, e.g. double start or produce before start
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A blocking operation observed cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Durable buffer storage errors
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    /// Whether the error may go away by reconnecting and trying again
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }

    /// Get error kind label
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Transport(_) => "transport",
            BrokerError::Serialization(_) => "serialization",
            BrokerError::Deserialization(_) => "deserialization",
            BrokerError::Handler(_) => "handler",
            BrokerError::InvalidState(_) => "invalid_state",
            BrokerError::Cancelled => "cancelled",
            BrokerError::Configuration(_) => "configuration",
            BrokerError::Storage(_) => "storage",
        }
    }

    /// Wrap any displayable failure raised by user code
    pub fn handler(err: impl std::fmt::Display) -> Self {
        BrokerError::Handler(err.to_string())
    }
}

/// Conversion from serde_json::Error
///
/// JSON encode and decode failures share one error type upstream, so the
/// codec maps them explicitly; this conversion covers encoding.
impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for BrokerError {
    fn from(err: validator::ValidationErrors) -> Self {
        BrokerError::Configuration(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        BrokerError::Configuration(err.to_string())
    }
}

/// Conversion from sled::Error
impl From<sled::Error> for BrokerError {
    fn from(err: sled::Error) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BrokerError>;
