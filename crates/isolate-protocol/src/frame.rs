//! Frame definitions for the host-agent wire protocol.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A command execution request carried by [`Frame::ExecRequest`].
///
/// Stdin is not part of the request body; it arrives as subsequent
/// `stdin_chunk` frames terminated by `stdin_close`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Executable path (absolute, or relative to the working directory).
    pub path: String,

    /// Ordered argument list, not including the executable itself.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment for the child. The agent does not leak its own
    /// environment; the child sees exactly this mapping.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory; empty means "unset" (the agent substitutes its
    /// containment root when one is configured).
    #[serde(default)]
    pub working_dir: String,

    /// Execution deadline in milliseconds; 0 disables the deadline.
    #[serde(default)]
    pub timeout_ms: u64,

    /// When true, stdout/stderr are delivered as chunk frames in addition
    /// to being buffered into the final result.
    #[serde(default)]
    pub stream: bool,

    /// Advisory identity string. Carried on the wire and logged, but not
    /// enforced by the isolation layer.
    #[serde(default)]
    pub user: String,
}

/// One self-delimited record on the IPC byte stream.
///
/// The variant set is closed; unknown `type` values fail decoding and are
/// answered with an `error` frame by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Liveness probe. May be sent at any time, including while a command
    /// is running; the server answers with `pong` and keeps going.
    Ping,

    /// Liveness reply.
    Pong {
        /// Server wall-clock time, Unix epoch milliseconds.
        timestamp_ms: u64,
    },

    /// Start a command execution exchange.
    ExecRequest(ExecRequest),

    /// Bytes for the running child's stdin.
    StdinChunk {
        /// Raw bytes to write to the child.
        data: Vec<u8>,
    },

    /// End of the child's stdin.
    StdinClose,

    /// A chunk of the child's stdout (streaming mode only).
    Stdout {
        /// Raw bytes as read from the child, at most `chunk_size` long.
        data: Vec<u8>,
    },

    /// A chunk of the child's stderr (streaming mode only).
    Stderr {
        /// Raw bytes as read from the child, at most `chunk_size` long.
        data: Vec<u8>,
    },

    /// Terminal record for an exec exchange.
    Result {
        /// Child exit code; `128 + signal` for signal deaths, `-1` when a
        /// protocol or internal error is surfaced as a result.
        exit_code: i32,
        /// Buffered stdout, truncated at the server's `max_result_buffer`.
        #[serde(default)]
        stdout: Vec<u8>,
        /// Buffered stderr, truncated at the server's `max_result_buffer`.
        #[serde(default)]
        stderr: Vec<u8>,
        /// Wall-clock duration of the child in milliseconds.
        duration_ms: u64,
        /// Child start time, Unix epoch milliseconds.
        started_at_ms: u64,
        /// Child finish time, Unix epoch milliseconds.
        finished_at_ms: u64,
        /// Populated when the result was synthesized from a failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Terminal record for a failed exchange.
    Error {
        /// Human-readable failure description.
        message: String,
    },

    /// Start a file upload exchange.
    FilePutRequest {
        /// Destination path on the agent side.
        path: String,
        /// Octal permission bits for the created file; 0 means 0o644.
        #[serde(default)]
        mode: u32,
    },

    /// Bytes for an in-flight upload.
    FilePutChunk {
        /// Raw file bytes.
        data: Vec<u8>,
    },

    /// End of an upload.
    FilePutClose,

    /// Terminal record for an upload.
    FilePutResult {
        /// Total bytes written.
        bytes: u64,
        /// Populated when the upload failed mid-stream.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Start a file download exchange.
    FileGetRequest {
        /// Source path on the agent side.
        path: String,
    },

    /// Bytes for an in-flight download.
    FileGetChunk {
        /// Raw file bytes.
        data: Vec<u8>,
    },

    /// Terminal record for a download.
    FileGetResult {
        /// Total bytes sent.
        bytes: u64,
        /// Populated when the source failed mid-read.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    /// The wire name of this frame's discriminant, for logs and errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Ping => "ping",
            Frame::Pong { .. } => "pong",
            Frame::ExecRequest(_) => "exec_request",
            Frame::StdinChunk { .. } => "stdin_chunk",
            Frame::StdinClose => "stdin_close",
            Frame::Stdout { .. } => "stdout",
            Frame::Stderr { .. } => "stderr",
            Frame::Result { .. } => "result",
            Frame::Error { .. } => "error",
            Frame::FilePutRequest { .. } => "file_put_request",
            Frame::FilePutChunk { .. } => "file_put_chunk",
            Frame::FilePutClose => "file_put_close",
            Frame::FilePutResult { .. } => "file_put_result",
            Frame::FileGetRequest { .. } => "file_get_request",
            Frame::FileGetChunk { .. } => "file_get_chunk",
            Frame::FileGetResult { .. } => "file_get_result",
        }
    }
}
