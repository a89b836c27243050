//! Protocol types for isolate host-agent communication.
//!
//! This crate defines the wire protocol spoken between the host client and
//! the agent daemon (`agentd`), plus the transport endpoints (Unix domain
//! sockets and AF_VSOCK) the frames travel over.
//!
//! # Protocol Overview
//!
//! Communication uses JSON-encoded frames over a reliable byte stream. Each
//! frame is prefixed with a 4-byte big-endian length header.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 BE)  | JSON frame body   |
//! +----------------+-------------------+
//! ```
//!
//! A connection carries exactly one exec or file-transfer exchange and is
//! then closed; only `ping`/`pong` may repeat on an idle connection.

#![deny(missing_docs)]

mod buffer;
mod codec;
mod frame;
pub mod transport;

pub use buffer::BoundedBuffer;
pub use codec::{encode_frame, epoch_millis, CodecError, FrameReader, FrameWriter};
pub use frame::{ExecRequest, Frame};

/// Maximum frame size accepted by the codec.
///
/// Caps decode-side allocation so a corrupt or hostile peer cannot force
/// unbounded memory use.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Default number of bytes carried per stream chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default cap on the bytes retained per stream in a buffered result.
pub const DEFAULT_MAX_RESULT_BUFFER: usize = 4 * 1024 * 1024;

/// Exit code reported when a protocol or internal error is surfaced as a
/// command result instead of a typed error.
pub const EXEC_ERROR_EXIT_CODE: i32 = -1;

/// File mode applied to uploads that request mode `0`.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
