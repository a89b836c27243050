//! High-level session façade.
//!
//! An [`AgentSession`] bundles an [`IpcClient`] with, optionally, the
//! [`AgentSupervisor`] that spawned the daemon it talks to. It adds no
//! protocol behavior of its own.

use crate::client::{CancelToken, CommandStream, IpcClient};
use crate::command::{Command, ExecResult};
use crate::error::Result;
use crate::supervisor::AgentSupervisor;
use isolate_protocol::transport::Endpoint;
use std::io::{Read, Write};
use std::path::PathBuf;

/// A connection handle to one agent, with optional daemon ownership.
pub struct AgentSession {
    client: IpcClient,
    supervisor: Option<AgentSupervisor>,
}

impl AgentSession {
    /// Session against an explicit endpoint; no daemon management.
    pub fn connect(endpoint: Endpoint) -> Self {
        Self {
            client: IpcClient::new(endpoint),
            supervisor: None,
        }
    }

    /// Session against a Unix socket; no daemon management.
    pub fn connect_unix(path: impl Into<PathBuf>) -> Self {
        Self {
            client: IpcClient::unix(path.into()),
            supervisor: None,
        }
    }

    /// Session against the per-user default agent, starting a daemon when
    /// none is running. The daemon (if this session spawned it) is reaped
    /// on [`close`](Self::close) or drop.
    pub fn auto(root_dir: Option<PathBuf>) -> Result<Self> {
        let supervisor = AgentSupervisor::with_defaults(root_dir)?;
        supervisor.start()?;
        let client = supervisor.client();
        Ok(Self {
            client,
            supervisor: Some(supervisor),
        })
    }

    /// Probe agent liveness.
    pub fn ping(&self) -> Result<()> {
        self.client.ping(None)
    }

    /// Run a command to completion, buffering its output.
    pub fn exec(&self, cmd: Command) -> Result<ExecResult> {
        self.client.exec(cmd, None)
    }

    /// Run a command with live stdout/stderr delivery.
    pub fn exec_stream(&self, cmd: Command) -> Result<CommandStream> {
        self.client.exec_stream(cmd, None)
    }

    /// Upload a byte source to a path on the agent side.
    pub fn copy_to(&self, source: impl Read, dest: &str) -> Result<u64> {
        self.client.copy_to(source, dest, None)
    }

    /// Download a path on the agent side into a sink.
    pub fn copy_from(&self, src: &str, sink: &mut dyn Write) -> Result<u64> {
        self.client.copy_from(src, sink, None)
    }

    /// The underlying client, for cancellable calls.
    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    /// A fresh cancellation token usable with [`client`](Self::client).
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new()
    }

    /// Whether this session manages its own daemon.
    pub fn owns_daemon(&self) -> bool {
        self.supervisor.is_some()
    }

    /// End the session, stopping the supervised daemon if there is one.
    pub fn close(self) -> Result<()> {
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop()?;
        }
        Ok(())
    }
}
