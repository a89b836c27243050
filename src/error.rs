//! Error types for the host-side client library.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<thing>: <reason>"`
//! - **Case**: all lowercase (Rust convention for error messages)
//! - **Context**: include the operation and relevant identifiers (socket
//!   path, remote path, argument index) when available
//!
//! Variants mirror the protocol's failure taxonomy so callers can match on
//! kind instead of parsing message strings.

use thiserror::Error;

/// Result type alias using the client library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client library.
#[derive(Error, Debug)]
pub enum Error {
    /// Dial failure, unexpected EOF, broken pipe.
    #[error("transport failed: {operation}: {reason}")]
    Transport {
        /// The operation that failed (e.g. "dial agent", "read frame").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Malformed frame or a record type that is invalid for the current
    /// protocol state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A path escaped the containment root, or the shell/interpreter policy
    /// rejected the request.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// Chroot was requested but is unsupported or lacks privileges.
    #[error("isolation unavailable: {0}")]
    IsolationUnavailable(String),

    /// The agent daemon could not be launched.
    #[error("child spawn failed: {operation}: {reason}")]
    ChildSpawn {
        /// The operation that failed (e.g. "spawn agent daemon").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A deadline fired before the operation completed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// File transfer or source/sink I/O failed.
    #[error("file transfer failed: {operation}: {reason}")]
    FileIo {
        /// The operation that failed (e.g. "copy to", "open source").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// The operation is not implemented on this build or platform.
    #[error("operation not supported: {0}")]
    Unavailable(String),
}

impl Error {
    /// Create a transport error.
    pub fn transport(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Create a child spawn error.
    pub fn child_spawn(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::ChildSpawn {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a deadline exceeded error.
    pub fn deadline(reason: impl Into<String>) -> Self {
        Self::DeadlineExceeded(reason.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Create a file I/O error.
    pub fn file_io(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::FileIo {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }
}
