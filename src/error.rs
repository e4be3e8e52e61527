//! Error types for the relay and the negotiator

use thiserror::Error;

/// Relay error
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listen socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport-level I/O failure
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket upgrade failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The relay no longer accepts connections
    #[error("Relay is shutting down")]
    ShuttingDown,
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Why a single delivery did not reach its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Outbound queue is full, the envelope is dropped for this recipient.
    #[error("outbound queue full")]
    Full,

    /// Connection is closing or closed.
    #[error("connection closed")]
    Closed,
}

/// Malformed signaling frame
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("frame is not a valid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has an empty event field")]
    MissingKind,
}

/// Failures reported by the peer-connection primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// A session description was rejected or could not be produced
    #[error("session description error: {0}")]
    Description(String),

    /// A network-path candidate was rejected
    #[error("candidate error: {0}")]
    Candidate(String),

    /// A local track could not be attached
    #[error("track error: {0}")]
    Track(String),

    /// The peer connection was closed while the operation was pending
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying peer transport failed
    #[error("peer transport error: {0}")]
    Transport(String),
}

/// Negotiator error
#[derive(Debug, Error)]
pub enum NegotiatorError {
    /// No signaling address configured, or the transport could not be opened
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// The session was closed
    #[error("Session already closed")]
    AlreadyClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

/// Result type for negotiator operations
pub type NegotiatorResult<T> = Result<T, NegotiatorError>;

/// Media capture failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    Denied(String),

    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
