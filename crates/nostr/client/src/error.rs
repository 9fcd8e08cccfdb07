//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid relay URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Wire message could not be encoded or decoded
    #[error("Message error: {0}")]
    Message(#[from] crate::message::MessageError),

    /// NIP-11 relay information could not be fetched
    #[error("Relay information error: {0}")]
    RelayInfo(String),

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The relay is not known to the pool
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// The pool (or a connection) has been disposed
    #[error("Relay pool has been disposed")]
    Disposed,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
