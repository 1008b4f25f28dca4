//! Error types for the pub/sub layer

use thiserror::Error;

/// Pub/sub error types
#[derive(Debug, Error)]
pub enum Error {
    /// Startup-time misconfiguration. Never recovered.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid publication: {0}")]
    InvalidPublication(String),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker write error: {0}")]
    BrokerWrite(String),

    #[error("Broker read error: {0}")]
    BrokerRead(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Result type for pub/sub operations
pub type Result<T> = std::result::Result<T, Error>;
