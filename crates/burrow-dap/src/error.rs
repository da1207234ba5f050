//! DAP client error types.

use thiserror::Error;

/// Errors from DAP protocol operations.
#[derive(Debug, Error)]
pub enum DapError {
    /// Establishing the transport connection failed.
    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    /// Framing-level error: malformed header block or truncated frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame body was not valid JSON or not a known message shape.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer violated the protocol's correlation rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The adapter answered a request with `success: false`.
    #[error("adapter rejected request: {message}")]
    Rejected {
        /// The rejection message from the adapter, plus any extra detail
        /// fields the response carried beyond the standard envelope.
        message: String,
    },

    /// The connection closed while a call or event wait was in flight.
    #[error("connection closed")]
    ConnectionClosed,
}
