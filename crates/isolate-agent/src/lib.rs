//! isolate guest agent.
//!
//! This crate implements the agent side of the isolate IPC protocol: a
//! long-lived daemon (`agentd`) that accepts framed requests on a Unix
//! domain socket or vsock port, executes child processes with optional
//! chroot isolation, streams their output back to the caller, and serves
//! bidirectional file transfers.
//!
//! The daemon logic lives in library modules so the host test-suite can
//! drive a server in-process over a socketpair instead of spawning the
//! binary.

pub mod chroot;
pub mod env;
pub mod error;
pub mod server;
pub mod validation;

pub use chroot::ChrootExecutor;
pub use error::AgentError;
pub use server::{Server, ServerConfig};
