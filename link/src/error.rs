//! Error types for trade-link.

use thiserror::Error;

/// Errors surfaced by the trade-link client.
#[derive(Error, Debug, Clone)]
pub enum TradeLinkError {
    /// Invalid or missing client configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The connection could not be established or broke while in use.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The session was torn down while the operation was in flight.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The session has already been disconnected.
    #[error("Session closed")]
    SessionClosed,

    /// The operation did not complete within its deadline.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The gateway answered a specific call with an error.
    #[error("Gateway error {code}: {message}")]
    GatewayError { code: i64, message: String },

    /// A bootstrap request failed during session synchronization.
    #[error("Synchronization error: {0}")]
    SyncError(String),

    /// A frame could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The gateway process could not be started or controlled.
    #[error("Process error: {0}")]
    ProcessError(String),
}

/// Result type for trade-link operations.
pub type Result<T> = std::result::Result<T, TradeLinkError>;
