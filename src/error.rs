//! Error types for daemon-client.

use thiserror::Error;

/// Main error type for all daemon-client operations.
///
/// Every failed request resolves to exactly one of these variants; a caller is
/// never left waiting on a reply that cannot arrive.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Establishing the connection failed (DNS, TCP, TLS or WebSocket upgrade).
    ///
    /// Not retried internally.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed envelope: invalid JSON, missing required field, wrong shape.
    ///
    /// Isolated to a single message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request id was registered while already in flight.
    #[error("Duplicate request id: {0}")]
    DuplicateRequest(String),

    /// The transport died while the request was outstanding.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The caller cancelled the wait.
    #[error("Request cancelled")]
    Cancelled,

    /// The peer answered with a non-empty `error` field.
    #[error("Remote error for '{command}': {message}")]
    Remote {
        /// Command the failing request carried.
        command: String,
        /// Error text reported by the peer.
        message: String,
    },

    /// Operation is not valid in the current lifecycle state.
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// TLS configuration error (bad key, bad root certificate).
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// WebSocket layer error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl DaemonError {
    /// True for outcomes caused by the transport going away.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DaemonError::ConnectionLost(_))
    }
}

/// Result type alias using DaemonError.
pub type Result<T> = std::result::Result<T, DaemonError>;
