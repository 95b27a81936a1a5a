//! Error types for the Stratum v1 session.

use thiserror::Error;

/// Stratum session errors.
///
/// Every variant ends the current session; the driver reconnects with
/// backoff unless shutdown was requested.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error on the outbound path
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A single line grew past the framing bound
    #[error("Line exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },

    /// Stream closed with a partial line buffered
    #[error("Connection closed mid-line ({pending} bytes buffered)")]
    TruncatedLine { pending: usize },

    /// Connection error
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Pool rejected mining.subscribe
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Pool rejected mining.authorize
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Invalid URL format
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Pool closed the connection
    #[error("Connection lost")]
    Disconnected,

    /// Pool asked us to reconnect (client.reconnect)
    #[error("Pool requested reconnect")]
    ReconnectRequested,

    /// Handshake did not complete in time
    #[error("Timeout waiting for handshake")]
    Timeout,
}

impl StratumError {
    /// True for errors raised by the line framing layer.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            StratumError::LineTooLong { .. } | StratumError::TruncatedLine { .. }
        )
    }
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
