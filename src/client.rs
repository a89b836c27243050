//! The framed IPC client.
//!
//! Stateless between calls: every operation dials a fresh connection, runs
//! one exchange, and closes. Cancellation is propagated by shutting the
//! connection down, which both ends observe as EOF.

use crate::command::{Command, ExecResult};
use crate::error::{Error, Result};
use isolate_protocol::transport::{Conn, Endpoint};
use isolate_protocol::{
    BoundedBuffer, CodecError, ExecRequest, Frame, FrameReader, FrameWriter, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_RESULT_BUFFER,
};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::debug;

/// Depth of the stdout/stderr channels handed out by [`IpcClient::exec_stream`].
/// Bounded so a stalled consumer applies backpressure to the agent instead
/// of buffering without limit.
const STREAM_CHANNEL_DEPTH: usize = 32;

type ConnReader = FrameReader<Box<dyn Conn>>;

/// A caller-held cancellation handle.
///
/// Operations register their connection here; `cancel` shuts every
/// registered connection down, which unwinds the in-flight exchange on both
/// ends. One token may span several operations.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    conns: Mutex<Vec<Box<dyn Conn>>>,
}

impl CancelToken {
    /// Create a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel: close every registered connection.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let conns = self.inner.conns.lock().unwrap_or_else(|e| e.into_inner());
        for conn in conns.iter() {
            let _ = conn.shutdown();
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, conn: Box<dyn Conn>) {
        if self.is_cancelled() {
            let _ = conn.shutdown();
            return;
        }
        self.inner
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(conn);
    }
}

/// A live streaming execution.
///
/// `stdout`/`stderr` deliver chunks in the order the agent wrote them; the
/// terminal result arrives on `done`, and the chunk channels close only
/// after it. Dropping the stream cancels it.
pub struct CommandStream {
    /// Stdout chunks, in arrival order.
    pub stdout: Receiver<Vec<u8>>,
    /// Stderr chunks, in arrival order.
    pub stderr: Receiver<Vec<u8>>,
    /// The terminal result (or a synthesized exit-code -1 result).
    pub done: Receiver<ExecResult>,
    conn: Box<dyn Conn>,
    cancelled: Arc<AtomicBool>,
}

impl CommandStream {
    /// Abort the execution: closes the connection and, in consequence, all
    /// three channels. The `done` channel yields a synthesized result.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.conn.shutdown();
    }

    /// Block for the terminal result, leaving chunk draining to the caller.
    pub fn wait(&self) -> Result<ExecResult> {
        self.done
            .recv()
            .map_err(|_| Error::cancelled("stream closed before a result arrived"))
    }

    /// End the stream, cancelling the execution if it is still running.
    pub fn close(self) {
        // Drop cancels.
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Client for one agent endpoint.
pub struct IpcClient {
    endpoint: Endpoint,
    chunk_size: usize,
    max_result_buffer: usize,
}

impl IpcClient {
    /// Create a client for the given endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_result_buffer: DEFAULT_MAX_RESULT_BUFFER,
        }
    }

    /// Shorthand for a Unix-socket client.
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new(Endpoint::unix(path.into()))
    }

    /// Override the stdin/file chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Override the cap on locally buffered stdout/stderr.
    pub fn with_max_result_buffer(mut self, max: usize) -> Self {
        self.max_result_buffer = max;
        self
    }

    /// The endpoint this client dials.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Probe agent liveness.
    pub fn ping(&self, cancel: Option<&CancelToken>) -> Result<()> {
        let (mut reader, writer) = self.open(cancel)?;
        writer
            .send(&Frame::Ping)
            .map_err(|e| Error::transport("send ping", e))?;
        match reader.read_frame() {
            Ok(Frame::Pong { .. }) => Ok(()),
            Ok(other) => Err(Error::protocol(format!(
                "unexpected {} frame in reply to ping",
                other.type_name()
            ))),
            Err(e) => Err(read_failure(e, cancel)),
        }
    }

    /// Run a command to completion, buffering its output.
    ///
    /// Policy rejections and spawn failures reported by the agent come back
    /// as a result with exit code -1 and the message on stderr; `Err` is
    /// reserved for transport and protocol failures.
    pub fn exec(&self, mut cmd: Command, cancel: Option<&CancelToken>) -> Result<ExecResult> {
        let (mut reader, writer) = self.open(cancel)?;
        let writer = Arc::new(writer);

        writer
            .send(&exec_request_frame(&cmd, false))
            .map_err(|e| Error::transport("send exec request", e))?;
        self.spawn_stdin_pump(Arc::clone(&writer), cmd.stdin.take());

        let mut stdout_buf = BoundedBuffer::new(self.max_result_buffer);
        let mut stderr_buf = BoundedBuffer::new(self.max_result_buffer);

        loop {
            match reader.read_frame() {
                Ok(Frame::Stdout { data }) => stdout_buf.write(&data),
                Ok(Frame::Stderr { data }) => stderr_buf.write(&data),
                Ok(Frame::Result {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    started_at_ms,
                    finished_at_ms,
                    error: _,
                }) => {
                    // chunks already delivered win over an empty buffered copy
                    let stdout = if stdout.is_empty() {
                        stdout_buf.into_bytes()
                    } else {
                        stdout
                    };
                    let stderr = if stderr.is_empty() {
                        stderr_buf.into_bytes()
                    } else {
                        stderr
                    };
                    return Ok(ExecResult::from_wire(
                        exit_code,
                        stdout,
                        stderr,
                        duration_ms,
                        started_at_ms,
                        finished_at_ms,
                    ));
                }
                Ok(Frame::Error { message }) => {
                    return Ok(ExecResult::from_error_message(&message));
                }
                Ok(other) => {
                    return Err(Error::protocol(format!(
                        "unexpected {} frame during exec",
                        other.type_name()
                    )));
                }
                Err(e) => return Err(read_failure(e, cancel)),
            }
        }
    }

    /// Run a command, delivering stdout/stderr chunks as they arrive.
    pub fn exec_stream(
        &self,
        mut cmd: Command,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandStream> {
        let conn = self.dial()?;
        if let Some(token) = cancel {
            token.register(clone_conn(conn.as_ref())?);
        }
        let cancel_conn = clone_conn(conn.as_ref())?;
        let writer = Arc::new(FrameWriter::new(clone_conn(conn.as_ref())?));
        let reader = FrameReader::new(conn);

        writer
            .send(&exec_request_frame(&cmd, true))
            .map_err(|e| Error::transport("send exec request", e))?;
        self.spawn_stdin_pump(Arc::clone(&writer), cmd.stdin.take());

        let (stdout_tx, stdout_rx) = mpsc::sync_channel(STREAM_CHANNEL_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::sync_channel(STREAM_CHANNEL_DEPTH);
        let (done_tx, done_rx) = mpsc::sync_channel(1);

        let cancelled = Arc::new(AtomicBool::new(false));
        let forward_flag = Arc::clone(&cancelled);
        thread::Builder::new()
            .name("stream-forward".into())
            .spawn(move || forward_stream(reader, stdout_tx, stderr_tx, done_tx, forward_flag))
            .map_err(|e| Error::transport("spawn stream forwarder", e))?;

        Ok(CommandStream {
            stdout: stdout_rx,
            stderr: stderr_rx,
            done: done_rx,
            conn: cancel_conn,
            cancelled,
        })
    }

    /// Upload `source` to `dest` on the agent side. Returns the byte count
    /// reported by the agent's terminal record.
    pub fn copy_to(
        &self,
        mut source: impl Read,
        dest: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<u64> {
        if dest.is_empty() {
            return Err(Error::file_io("copy to", "destination path is required"));
        }
        let (mut reader, writer) = self.open(cancel)?;

        writer
            .send(&Frame::FilePutRequest {
                path: dest.to_string(),
                mode: 0,
            })
            .map_err(|e| Error::transport("send file_put_request", e))?;

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if cancel.is_some_and(|t| t.is_cancelled()) {
                return Err(Error::cancelled("copy to cancelled"));
            }
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => writer
                    .send(&Frame::FilePutChunk {
                        data: buf[..n].to_vec(),
                    })
                    .map_err(|e| Error::transport("send file_put_chunk", e))?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::file_io("read source", e)),
            }
        }
        writer
            .send(&Frame::FilePutClose)
            .map_err(|e| Error::transport("send file_put_close", e))?;

        match reader.read_frame() {
            Ok(Frame::FilePutResult { bytes, error: None }) => Ok(bytes),
            Ok(Frame::FilePutResult {
                error: Some(message),
                ..
            }) => Err(Error::file_io("copy to", message)),
            Ok(Frame::Error { message }) => Err(Error::file_io("copy to", message)),
            Ok(other) => Err(Error::protocol(format!(
                "unexpected {} frame during upload",
                other.type_name()
            ))),
            Err(e) => Err(read_failure(e, cancel)),
        }
    }

    /// Download `src` from the agent side into `sink`. Returns the byte
    /// count reported by the agent's terminal record.
    pub fn copy_from(
        &self,
        src: &str,
        sink: &mut dyn Write,
        cancel: Option<&CancelToken>,
    ) -> Result<u64> {
        if src.is_empty() {
            return Err(Error::file_io("copy from", "source path is required"));
        }
        let (mut reader, writer) = self.open(cancel)?;

        writer
            .send(&Frame::FileGetRequest {
                path: src.to_string(),
            })
            .map_err(|e| Error::transport("send file_get_request", e))?;

        loop {
            match reader.read_frame() {
                Ok(Frame::FileGetChunk { data }) => {
                    sink.write_all(&data)
                        .map_err(|e| Error::file_io("write sink", e))?;
                }
                Ok(Frame::FileGetResult { bytes, error: None }) => {
                    sink.flush().map_err(|e| Error::file_io("flush sink", e))?;
                    return Ok(bytes);
                }
                Ok(Frame::FileGetResult {
                    error: Some(message),
                    ..
                }) => return Err(Error::file_io("copy from", message)),
                Ok(Frame::Error { message }) => return Err(Error::file_io("copy from", message)),
                Ok(other) => {
                    return Err(Error::protocol(format!(
                        "unexpected {} frame during download",
                        other.type_name()
                    )));
                }
                Err(e) => return Err(read_failure(e, cancel)),
            }
        }
    }

    fn dial(&self) -> Result<Box<dyn Conn>> {
        self.endpoint.dial().map_err(|e| {
            if e.kind() == io::ErrorKind::Unsupported {
                Error::unavailable(format!("{}: {}", self.endpoint.addr_label(), e))
            } else {
                Error::transport(
                    format!("dial agent at {}", self.endpoint.addr_label()),
                    e,
                )
            }
        })
    }

    /// Dial and split into reader/writer, registering the connection with
    /// the cancel token when one was supplied.
    fn open(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<(ConnReader, FrameWriter<Box<dyn Conn>>)> {
        let conn = self.dial()?;
        if let Some(token) = cancel {
            token.register(clone_conn(conn.as_ref())?);
        }
        let writer = FrameWriter::new(clone_conn(conn.as_ref())?);
        Ok((FrameReader::new(conn), writer))
    }

    fn spawn_stdin_pump(
        &self,
        writer: Arc<FrameWriter<Box<dyn Conn>>>,
        stdin: Option<Box<dyn Read + Send>>,
    ) {
        let chunk_size = self.chunk_size;
        let spawned = thread::Builder::new()
            .name("stdin-pump".into())
            .spawn(move || pump_stdin(writer, stdin, chunk_size));
        if let Err(e) = spawned {
            debug!(error = %e, "stdin pump spawn failed");
        }
    }
}

fn clone_conn(conn: &dyn Conn) -> Result<Box<dyn Conn>> {
    conn.try_clone()
        .map_err(|e| Error::transport("clone connection", e))
}

fn exec_request_frame(cmd: &Command, stream: bool) -> Frame {
    Frame::ExecRequest(ExecRequest {
        path: cmd.path.clone(),
        args: cmd.args.clone(),
        env: cmd.env.clone(),
        working_dir: cmd.working_dir.clone(),
        timeout_ms: cmd.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
        stream,
        user: cmd.user.clone(),
    })
}

/// Feed the caller's stdin source to the agent, then close.
///
/// Runs detached; when the exchange ends first, the next send fails against
/// the closed connection and the pump unwinds.
fn pump_stdin<W: Write>(
    writer: Arc<FrameWriter<W>>,
    stdin: Option<Box<dyn Read + Send>>,
    chunk_size: usize,
) {
    let Some(mut source) = stdin else {
        let _ = writer.send(&Frame::StdinClose);
        return;
    };

    let mut buf = vec![0u8; chunk_size];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if writer
                    .send(&Frame::StdinChunk {
                        data: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "stdin source read failed");
                break;
            }
        }
    }
    let _ = writer.send(&Frame::StdinClose);
}

/// Forward inbound frames to the stream channels until the terminal record.
/// The channel senders drop on return, so closure strictly follows `done`.
fn forward_stream(
    mut reader: ConnReader,
    stdout_tx: SyncSender<Vec<u8>>,
    stderr_tx: SyncSender<Vec<u8>>,
    done_tx: SyncSender<ExecResult>,
    cancelled: Arc<AtomicBool>,
) {
    loop {
        match reader.read_frame() {
            Ok(Frame::Stdout { data }) => {
                // a dropped receiver is not fatal; the result must still land
                let _ = stdout_tx.send(data);
            }
            Ok(Frame::Stderr { data }) => {
                let _ = stderr_tx.send(data);
            }
            Ok(Frame::Result {
                exit_code,
                stdout,
                stderr,
                duration_ms,
                started_at_ms,
                finished_at_ms,
                error: _,
            }) => {
                let _ = done_tx.send(ExecResult::from_wire(
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    started_at_ms,
                    finished_at_ms,
                ));
                return;
            }
            Ok(Frame::Error { message }) => {
                let _ = done_tx.send(ExecResult::from_error_message(&message));
                return;
            }
            Ok(other) => {
                debug!(frame = other.type_name(), "ignoring unexpected frame");
            }
            Err(e) => {
                let message = if cancelled.load(Ordering::SeqCst) {
                    "operation cancelled: stream closed by caller".to_string()
                } else {
                    format!("transport failed: read frame: {}", e)
                };
                let _ = done_tx.send(ExecResult::from_error_message(&message));
                return;
            }
        }
    }
}

fn read_failure(e: CodecError, cancel: Option<&CancelToken>) -> Error {
    if cancel.is_some_and(|t| t.is_cancelled()) {
        return Error::cancelled("connection closed by cancel token");
    }
    match e {
        CodecError::Json(err) => Error::protocol(format!("malformed frame: {}", err)),
        CodecError::TooLarge(n) => Error::protocol(format!("frame too large: {} bytes", n)),
        other => Error::transport("read frame", other),
    }
}
