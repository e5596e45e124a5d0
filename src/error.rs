//! Error types for the RFB server engine.

use std::io;
use thiserror::Error;

/// Result type for RFB server operations.
pub type Result<T> = std::result::Result<T, RfbError>;

/// Errors raised during the RFB handshake, before a session reaches the
/// running state. A handshake failure never affects other sessions.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The client speaks a protocol version this server cannot serve
    /// (anything below RFB 3.3).
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// VNC authentication failed or the client picked a security type
    /// the server did not offer.
    #[error("authentication failed")]
    AuthFailure,

    /// The client did not complete the handshake in time.
    #[error("handshake timed out")]
    Timeout,
}

/// Errors that can occur in RFB server operations.
#[derive(Debug, Error)]
pub enum RfbError {
    /// Transport read/write/accept/connect failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The session never entered the running state.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Malformed or out-of-spec client message. The session is closed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A specific encoder could not encode a rectangle. Recovered locally
    /// by falling back towards Raw.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Framebuffer resize failed; the framebuffer keeps its old geometry.
    #[error("resize failed: {0}")]
    Resize(String),

    /// Operation invalid in the current server state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
