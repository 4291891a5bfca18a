//! Error types for pg-replicant.
//!
//! All errors in this crate are represented by [`PgWireError`]. The variants fall
//! into three groups:
//! - codec and schema errors ([`InvalidFormat`](PgWireError::InvalidFormat),
//!   [`LengthMismatch`](PgWireError::LengthMismatch))
//! - single-message decode failures that leave the connection usable
//!   ([`UnknownEnumValue`](PgWireError::UnknownEnumValue),
//!   [`UnknownCommandTag`](PgWireError::UnknownCommandTag))
//! - connection-fatal conditions ([`ConnectionClosed`](PgWireError::ConnectionClosed),
//!   [`DirectionViolation`](PgWireError::DirectionViolation),
//!   [`ProtocolDesync`](PgWireError::ProtocolDesync), ...)
//!
//! See [`PgWireError::is_fatal`] for the propagation policy.

use thiserror::Error;

use crate::protocol::Role;

/// Error type for all pg-replicant operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PgWireError {
    /// I/O error on the underlying transport.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Malformed format specifier, or values that do not fit it.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A decode consumed a different number of bytes than the buffer held.
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A message was sent or received against its declared direction.
    #[error("direction violation: {message} may not be sent by the {role}")]
    DirectionViolation { message: &'static str, role: Role },

    /// An enumerated payload byte/word had no known meaning.
    #[error("unknown {kind} value: {value}")]
    UnknownEnumValue { kind: &'static str, value: i64 },

    /// CommandComplete carried a tag whose leading word is not recognized.
    #[error("unknown command tag: {0:?}")]
    UnknownCommandTag(String),

    /// CopyBothResponse declared textual overall format with binary columns.
    #[error("inconsistent copy format: {0}")]
    InconsistentFormat(String),

    /// The peer closed the socket in the middle of (or before) a frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server deviated from an expected message sequence.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// A declared-but-unimplemented variant or feature was requested.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Malformed frame (bad length word, empty CopyData, invalid text).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server error - PostgreSQL returned an error response.
    ///
    /// The message typically includes SQLSTATE code.
    #[error("server error: {0}")]
    Server(String),

    /// Task error - worker panicked or terminated unexpectedly.
    #[error("task error: {0}")]
    Task(String),
}

impl PgWireError {
    /// Returns `true` if this error must terminate the connection.
    ///
    /// Fatal errors are never retried transparently; a caller that wants to
    /// resume has to reconnect from the last known replication cursor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgWireError::Io(_)
                | PgWireError::ConnectionClosed
                | PgWireError::DirectionViolation { .. }
                | PgWireError::ProtocolDesync(_)
                | PgWireError::InconsistentFormat(_)
                | PgWireError::Protocol(_)
                | PgWireError::Task(_)
        )
    }

    /// Returns `true` if this is a decode failure scoped to a single message.
    ///
    /// The frame was consumed in full, so the connection stays in sync and the
    /// caller may skip the message.
    #[inline]
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            PgWireError::UnknownEnumValue { .. }
                | PgWireError::UnknownCommandTag(_)
                | PgWireError::LengthMismatch { .. }
                | PgWireError::InvalidFormat(_)
                | PgWireError::Unsupported(_)
        )
    }

    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, PgWireError::Io(_))
    }

    /// Returns `true` if this is a server error.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, PgWireError::Server(_))
    }

    /// Returns `true` if this error is likely transient and worth a reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PgWireError::Io(_) | PgWireError::ConnectionClosed | PgWireError::Task(_)
        )
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for PgWireError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return PgWireError::ConnectionClosed;
        }
        PgWireError::Io(err.to_string())
    }
}

/// Result type alias for pg-replicant operations.
pub type Result<T> = std::result::Result<T, PgWireError>;
