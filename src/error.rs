//! Error types for relaywire.

use thiserror::Error;

/// Main error type for all relaywire operations.
#[derive(Debug, Error)]
pub enum RelaywireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (request metadata).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed header, wrong frame for state, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed, locally or by the remote side.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - outbound queue stayed full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// No peer of the opposite role is registered on the channel.
    #[error("Peer not available")]
    PeerNotAvailable,

    /// No response arrived before the request deadline.
    #[error("Request timeout")]
    Timeout,

    /// A consumer already has a request in flight.
    #[error("Another operation in progress")]
    OperationInProgress,

    /// The remote peer answered with an error frame.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The server is already listening.
    #[error("Server already running")]
    AlreadyRunning,
}

/// Result type alias using RelaywireError.
pub type Result<T> = std::result::Result<T, RelaywireError>;
