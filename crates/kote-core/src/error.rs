//! Error types for kote.
//!
//! Per-message errors (`Format`, `Signature`, `ProtocolViolation`) stay local
//! to the message or session that produced them. `Storage` is the only class
//! that is surfaced to the operator as a failed operation.

use thiserror::Error;

/// Core error type for kote operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Router unreachable, SAM session down or control reply rejected.
    #[error("transport error: {0}")]
    Transport(String),

    /// Stream closed by the peer or the router.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote destination could not be reached.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Malformed frame.
    #[error("malformed frame: {0}")]
    Format(String),

    /// Claimed identity does not match the signature or the known key.
    #[error("signature verification failed")]
    Signature(String),

    /// Message not valid in the contact's current trust state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Address failed validation.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Local operation not allowed in the current state.
    #[error("{0}")]
    InvalidState(String),

    /// Contact or record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias using kote's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport-class failures are retried with backoff.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionClosed | Error::Unreachable(_) | Error::Timeout
        )
    }

    /// Per-message errors: the offending frame is dropped and the session
    /// carries on.
    pub fn should_silent_drop(&self) -> bool {
        matches!(
            self,
            Error::Format(_) | Error::Signature(_) | Error::ProtocolViolation(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
