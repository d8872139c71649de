//! Error types for the link runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the link runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The relay bridge could not be reached at all.
    #[error("Relay unreachable at {url}: {reason}")]
    RelayUnreachable { url: String, reason: String },

    /// The relay answered a request with a JSON-RPC error.
    #[error("Relay error {code}: {message}")]
    Relay { code: i64, message: String },

    /// No wireless adapter is present on this machine.
    #[error("No wireless adapter available")]
    NoAdapter,

    /// A connect-by-id targeted a peripheral discovery never surfaced.
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// Transport-level fault (missing characteristic, dead handle, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed traffic on an otherwise healthy transport.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error from the relay socket.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Error bubbled up from the system's wireless stack.
    #[error("Wireless stack error: {0}")]
    Wireless(#[from] btleplug::Error),
}
