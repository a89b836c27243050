//! isolate - host-to-guest command execution over a framed IPC protocol.
//!
//! A client library for talking to the `agentd` daemon: execute commands in
//! a sandboxed location with streamed stdout/stderr, transfer files in both
//! directions, and (optionally) manage the daemon's lifecycle from the
//! client host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  AgentSession (Command / ExecResult façade)      │
//! ├──────────────────────────────────────────────────┤
//! │  IpcClient         │  AgentSupervisor            │
//! │  (frame protocol)  │  (spawn/probe/reap agentd)  │
//! ├──────────────────────────────────────────────────┤
//! │  isolate-protocol (frames, unix/vsock transport) │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use isolate::{AgentSession, Command};
//!
//! // Connect to a running daemon (or use AgentSession::auto to spawn one).
//! let session = AgentSession::connect_unix("/run/isolate/agent.sock");
//!
//! let result = session
//!     .exec(Command::new("/bin/ls").arg("-la").working_dir("/tmp"))
//!     .unwrap();
//!
//! println!("exit {}: {}", result.exit_code, result.stdout_str());
//! ```
//!
//! Each operation opens one connection, runs one exchange, and closes it;
//! cancellation is propagated by closing the connection. See the
//! `isolate-agent` crate for the daemon side.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod command;
mod error;
mod process;
mod session;
mod supervisor;

pub use client::{CancelToken, CommandStream, IpcClient};
pub use command::{Command, ExecResult};
pub use error::{Error, Result};
pub use session::AgentSession;
pub use supervisor::{AgentSupervisor, DaemonSource, SupervisorConfig};

// Transport endpoints are part of the public surface: clients pick where to
// dial, daemon embedders pick where to listen.
pub use isolate_protocol::transport::{Endpoint, UnixEndpoint, VsockEndpoint};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
