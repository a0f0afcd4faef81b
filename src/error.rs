//! Error taxonomy for the transport and dispatch engine.
//!
//! Framing, routing, and collaborator failures all surface through
//! [`Error`]. Application-level code (handlers, subscribers, event sinks)
//! uses `anyhow` and is converted at the worker boundary.

use std::io;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No progress was made before the deadline elapsed.
    #[error("timed out waiting for peer")]
    Timeout,

    /// Peer reset, unexpected EOF, or another socket failure.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Start line or header block could not be parsed.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// Chunk-size line or declared chunk size exceeds the configured cap.
    #[error("chunk exceeds configured maximum")]
    ChunkTooLarge,

    #[error("header block exceeds configured maximum")]
    HeaderTooLarge,

    #[error("body exceeds configured maximum")]
    BodyTooLarge,

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("route already registered: {0}")]
    DuplicateRoute(String),

    #[error("no acceptable content type")]
    NoAcceptableContentType,

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("no route matched")]
    NotFound,

    /// Handshake or channel setup failed in the secure channel collaborator.
    #[error("secure channel error: {0}")]
    SecureChannel(String),

    #[error("no address found for {0}")]
    NoAddressFound(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl Error {
    /// Convenience constructor for EOF in the middle of a message.
    pub fn closed_mid_message() -> Self {
        Error::Connection(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before message was complete",
        ))
    }

    /// Whether a client may reconnect and resend after this failure,
    /// assuming no response bytes were observed yet.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::Connection(_) | Error::NoAddressFound(_)
        )
    }

    /// Whether this failure is a protocol violation detected while framing.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::MalformedChunk(_)
                | Error::ChunkTooLarge
                | Error::HeaderTooLarge
                | Error::BodyTooLarge
        )
    }
}
