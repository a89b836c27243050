//! Error types for the agent daemon.
//!
//! Error messages follow a consistent format: all lowercase, with the
//! failing operation named first and the reason after a colon. Failures
//! that reach a connected client are flattened into `error` frames; the
//! variants here exist so the server can distinguish policy rejections
//! (logged at warn, no child spawned) from plumbing failures.

use isolate_protocol::CodecError;
use thiserror::Error;

/// Result type alias using the agent's error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised inside the agent daemon.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A request violated the containment or interpreter policy.
    #[error("security violation: {0}")]
    Security(String),

    /// Chroot isolation was requested but cannot be provided.
    #[error("isolation unavailable: {0}")]
    IsolationUnavailable(String),

    /// Preparing the chroot template failed.
    #[error("chroot setup failed: {0}")]
    Chroot(String),

    /// Launching the child process failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Frame encode/decode or connection transfer failed.
    #[error("frame transfer failed: {0}")]
    Codec(#[from] CodecError),

    /// Filesystem or pipe I/O failed.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a security violation error.
    pub fn security(reason: impl Into<String>) -> Self {
        Self::Security(reason.into())
    }

    /// Create an isolation unavailable error.
    pub fn isolation_unavailable(reason: impl Into<String>) -> Self {
        Self::IsolationUnavailable(reason.into())
    }

    /// Create a chroot setup error.
    pub fn chroot(reason: impl Into<String>) -> Self {
        Self::Chroot(reason.into())
    }

    /// Create a spawn error.
    pub fn spawn(reason: impl Into<String>) -> Self {
        Self::Spawn(reason.into())
    }

    /// The message to embed in an `error` frame for this failure.
    pub fn frame_message(&self) -> String {
        self.to_string()
    }
}
