//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound queue to a subscriber is full or closed.
    #[error("Channel send error")]
    ChannelSend,

    /// The relay task is no longer accepting requests.
    #[error("Relay unavailable")]
    RelayUnavailable,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Error code sent to subscribers in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Json(_) => "INVALID_MESSAGE",
            GatewayError::ChannelSend => "SLOW_CONSUMER",
            GatewayError::RelayUnavailable => "UNAVAILABLE",
            GatewayError::Config(_) => "PROCESSING_ERROR",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
