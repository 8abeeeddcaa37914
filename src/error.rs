//! Error types for the GRIP subscription gateway

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// Covers protocol framing failures on the WebSocket-Over-HTTP surface,
/// graphql-ws frame errors, storage failures, and outbound publish errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Request-level failures on the WebSocket-Over-HTTP surface
    /// (missing `Connection-Id`, undecodable event framing). Fatal for
    /// the enclosing HTTP request only.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed graphql-ws frame or unparseable subscription query.
    /// Callers on the message path log these and keep the connection open.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Storage backend failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// A record that was expected to exist is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Two composed listeners set the same response header
    #[error("Header conflict: {0}")]
    HeaderConflict(String),

    /// Outbound EPCP publish failures
    #[error("Publish error: {0}")]
    Publish(String),

    /// Subscription replay/execution failures
    #[error("Execution error: {0}")]
    Execution(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error should map to a client-error (4xx) HTTP status
    /// on the WebSocket-Over-HTTP surface.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidRequest(_) | Error::Protocol(_))
    }
}
