//! The agent IPC server.
//!
//! One [`Server`] instance per daemon, shared immutably across connection
//! threads. Each connection carries at most one exec or file-transfer
//! exchange; within an exec, three pump threads (stdin consumer, stdout
//! streamer, stderr streamer) cooperate around the child process and are
//! joined before the terminal `result` frame is written.

use crate::chroot::ChrootExecutor;
use crate::env::merge_env;
use crate::error::{AgentError, Result};
use crate::validation;
use isolate_protocol::transport::{Conn, Listener};
use isolate_protocol::{
    epoch_millis, BoundedBuffer, CodecError, ExecRequest, Frame, FrameReader, FrameWriter,
    DEFAULT_CHUNK_SIZE, DEFAULT_FILE_MODE, DEFAULT_MAX_RESULT_BUFFER,
};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll interval while waiting for a child to exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type ConnReader = FrameReader<Box<dyn Conn>>;
type ConnWriter = FrameWriter<Box<dyn Conn>>;

/// Tunables for the agent server, immutable for its lifetime.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Bytes per stream chunk; 0 selects the default (32 KiB).
    pub chunk_size: usize,
    /// Cap on retained output per stream; 0 selects the default (4 MiB).
    pub max_result_buffer: usize,
    /// Containment root; `None` disables path validation entirely.
    pub root_dir: Option<PathBuf>,
    /// Jail children with chroot when a root is set.
    pub use_chroot_if_root: bool,
    /// Permit interpreter execution without chroot (insecure, dev only).
    pub allow_insecure: bool,
}

/// Executes guest commands upon requests from connected clients.
pub struct Server {
    chunk_size: usize,
    max_result_buffer: usize,
    root_dir: Option<PathBuf>,
    chroot: Option<ChrootExecutor>,
    allow_insecure: bool,
}

#[derive(Clone, Copy)]
enum StreamChannel {
    Stdout,
    Stderr,
}

impl Server {
    /// Construct a server, resolving the containment root and setting up
    /// chroot when requested.
    ///
    /// Fails with *isolation unavailable* when chroot was requested but the
    /// process lacks the privileges to enter a jail.
    pub fn new(cfg: ServerConfig) -> Result<Self> {
        let chunk_size = if cfg.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            cfg.chunk_size
        };
        let max_result_buffer = if cfg.max_result_buffer == 0 {
            DEFAULT_MAX_RESULT_BUFFER
        } else {
            cfg.max_result_buffer
        };

        let mut root_dir = None;
        let mut chroot = None;
        if let Some(dir) = &cfg.root_dir {
            let abs = if dir.is_absolute() {
                validation::clean_path(dir)
            } else {
                validation::clean_path(&std::env::current_dir()?.join(dir))
            };
            info!(root = %abs.display(), "restricting execution to containment root");

            if cfg.use_chroot_if_root {
                let jail = ChrootExecutor::new(&abs)?;
                if jail.requires_root() {
                    return Err(AgentError::isolation_unavailable(
                        "chroot requires root privileges; run as root or pass --no-chroot (insecure for untrusted scripts)",
                    ));
                }
                info!("chroot isolation enabled");
                chroot = Some(jail);
            }
            root_dir = Some(abs);
        }

        Ok(Self {
            chunk_size,
            max_result_buffer,
            root_dir,
            chroot,
            allow_insecure: cfg.allow_insecure,
        })
    }

    /// Accept connections until the listener fails fatally.
    ///
    /// Transient accept errors are logged and retried; each connection is
    /// handled on its own thread, sharing this server immutably.
    pub fn serve(self: &Arc<Self>, listener: &dyn Listener) -> io::Result<()> {
        info!(addr = %listener.addr_label(), "accepting connections");
        loop {
            match listener.accept() {
                Ok(conn) => {
                    let server = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name("agent-conn".into())
                        .spawn(move || server.serve_conn(conn));
                    if let Err(e) = spawned {
                        warn!(error = %e, "connection thread spawn failed");
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "transient accept error");
                }
                Err(e) => {
                    error!(error = %e, "accept loop terminating");
                    return Err(e);
                }
            }
        }
    }

    /// Handle a single connection to completion.
    pub fn serve_conn(&self, conn: Box<dyn Conn>) {
        if let Err(e) = self.handle_conn(conn.as_ref()) {
            warn!(error = %e, "connection error");
        }
    }

    fn handle_conn(&self, conn: &dyn Conn) -> Result<()> {
        let mut reader = FrameReader::new(conn.try_clone()?);
        let writer = FrameWriter::new(conn.try_clone()?);

        loop {
            let frame = match reader.read_frame() {
                Ok(frame) => frame,
                Err(CodecError::Eof) => {
                    debug!("connection closed");
                    return Ok(());
                }
                Err(e @ (CodecError::Json(_) | CodecError::TooLarge(_))) => {
                    self.send_error(&writer, &format!("invalid frame: {}", e));
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            match frame {
                Frame::Ping => {
                    writer.send(&Frame::Pong {
                        timestamp_ms: epoch_millis(),
                    })?;
                }
                Frame::ExecRequest(req) => {
                    self.run_exec(conn, &mut reader, &writer, req);
                    return Ok(());
                }
                Frame::FilePutRequest { path, mode } => {
                    self.handle_file_put(&mut reader, &writer, &path, mode);
                    return Ok(());
                }
                Frame::FileGetRequest { path } => {
                    self.handle_file_get(&writer, &path);
                    return Ok(());
                }
                other => {
                    self.send_error(
                        &writer,
                        &format!("unsupported frame {}", other.type_name()),
                    );
                    return Ok(());
                }
            }
        }
    }

    fn run_exec(
        &self,
        conn: &dyn Conn,
        reader: &mut ConnReader,
        writer: &ConnWriter,
        req: ExecRequest,
    ) {
        info!(
            path = %req.path,
            args = ?req.args,
            user = %req.user,
            stream = req.stream,
            timeout_ms = req.timeout_ms,
            "exec request"
        );

        // Without chroot, the lexical validator is the only containment.
        let mut effective_dir: Option<PathBuf> = None;
        if let Some(root) = &self.root_dir {
            if self.chroot.is_none() {
                match validation::validate_request(root, &req) {
                    Ok(dir) => effective_dir = Some(dir),
                    Err(e) => {
                        warn!(error = %e, "exec request rejected");
                        self.send_error(writer, &e.frame_message());
                        return;
                    }
                }

                if validation::is_interpreter(&req.path) {
                    if !self.allow_insecure {
                        warn!(path = %req.path, "refusing interpreter without chroot isolation");
                        self.send_error(
                            writer,
                            &format!(
                                "security violation: cannot execute interpreter {:?} without chroot isolation; scripts can escape the root directory",
                                req.path
                            ),
                        );
                        return;
                    }
                    warn!(
                        path = %req.path,
                        "executing interpreter in insecure mode; scripts can escape the root directory"
                    );
                }
            }
        }

        let mut command = Command::new(&req.path);
        command
            .args(&req.args)
            .env_clear()
            .envs(merge_env(None, &req.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so a deadline kill reaps the whole subtree.
            // SAFETY: setpgid is async-signal-safe and runs before exec.
            unsafe {
                command.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        match &self.chroot {
            Some(jail) => {
                if let Err(e) = jail.prepare(&mut command, &req.working_dir) {
                    self.send_error(writer, &e.frame_message());
                    return;
                }
            }
            None => {
                let dir = effective_dir.unwrap_or_else(|| PathBuf::from(&req.working_dir));
                if !dir.as_os_str().is_empty() {
                    command.current_dir(&dir);
                }
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, path = %req.path, "spawn failed");
                self.send_error(writer, &format!("spawn failed: {}", e));
                return;
            }
        };

        let started = Instant::now();
        let started_at_ms = epoch_millis();
        let deadline = (req.timeout_ms > 0).then(|| started + Duration::from_millis(req.timeout_ms));

        let (Some(stdin_pipe), Some(stdout_pipe), Some(stderr_pipe)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            self.send_error(writer, "child pipes unavailable");
            return;
        };

        let stream = req.stream;
        let child_pid = child.id();
        let child_done = AtomicBool::new(false);
        let (wait_result, stdout_buf, stderr_buf) = thread::scope(|s| {
            let stdout_pump =
                s.spawn(move || self.pump_stream(stdout_pipe, writer, stream, StreamChannel::Stdout));
            let stderr_pump =
                s.spawn(move || self.pump_stream(stderr_pipe, writer, stream, StreamChannel::Stderr));
            let child_done = &child_done;
            let stdin_pump = s.spawn(move || {
                let ended = consume_stdin(reader, writer, stdin_pipe);
                // A dropped connection mid-exec takes the child with it.
                if matches!(ended, StdinEnd::ConnectionLost)
                    && !child_done.load(Ordering::SeqCst)
                {
                    debug!(pid = child_pid, "connection lost, killing child");
                    kill_process_group(child_pid);
                }
            });

            let wait_result = wait_child(&mut child, deadline);
            child_done.store(true, Ordering::SeqCst);

            // Unblock the stdin pump; it observes EOF on the connection.
            if let Err(e) = conn.shutdown_read() {
                debug!(error = %e, "shutdown_read after child exit failed");
            }

            let stdout_buf = stdout_pump
                .join()
                .unwrap_or_else(|_| BoundedBuffer::new(self.max_result_buffer));
            let stderr_buf = stderr_pump
                .join()
                .unwrap_or_else(|_| BoundedBuffer::new(self.max_result_buffer));
            let _ = stdin_pump.join();

            (wait_result, stdout_buf, stderr_buf)
        });

        let status = match wait_result {
            Ok(status) => status,
            Err(e) => {
                self.send_error(writer, &format!("wait failed: {}", e));
                return;
            }
        };

        let exit_code = exit_code_from_status(status);
        let finished_at_ms = epoch_millis();
        let duration_ms = started.elapsed().as_millis() as u64;

        if stdout_buf.truncated() || stderr_buf.truncated() {
            debug!(limit = self.max_result_buffer, "result buffers truncated");
        }
        info!(exit_code, duration_ms, "exec finished");

        let result = Frame::Result {
            exit_code,
            stdout: stdout_buf.into_bytes(),
            stderr: stderr_buf.into_bytes(),
            duration_ms,
            started_at_ms,
            finished_at_ms,
            error: None,
        };
        if let Err(e) = writer.send(&result) {
            debug!(error = %e, "result frame lost, peer gone");
        }
    }

    /// Read one pipe in `chunk_size` slices, retaining a bounded copy and
    /// optionally streaming each chunk.
    fn pump_stream<R: Read>(
        &self,
        mut pipe: R,
        writer: &ConnWriter,
        stream: bool,
        channel: StreamChannel,
    ) -> BoundedBuffer {
        let mut collector = BoundedBuffer::new(self.max_result_buffer);
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => return collector,
                Ok(n) => {
                    collector.write(&buf[..n]);
                    if stream {
                        let frame = match channel {
                            StreamChannel::Stdout => Frame::Stdout {
                                data: buf[..n].to_vec(),
                            },
                            StreamChannel::Stderr => Frame::Stderr {
                                data: buf[..n].to_vec(),
                            },
                        };
                        // On a lost peer, keep draining so the child never
                        // blocks on a full pipe.
                        let _ = writer.send(&frame);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return collector,
            }
        }
    }

    fn handle_file_put(&self, reader: &mut ConnReader, writer: &ConnWriter, path: &str, mode: u32) {
        if path.is_empty() {
            self.send_error(writer, "path is required");
            return;
        }
        let mode = if mode == 0 { DEFAULT_FILE_MODE } else { mode };

        let target = Path::new(path);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = fs::create_dir_all(parent) {
                    self.send_error(writer, &format!("create parent directory failed: {}", e));
                    return;
                }
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = match options.open(target) {
            Ok(file) => file,
            Err(e) => {
                self.send_error(writer, &format!("open {:?} failed: {}", path, e));
                return;
            }
        };

        let mut written: u64 = 0;
        loop {
            let frame = match reader.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    self.send_error(writer, &format!("upload interrupted: {}", e));
                    return;
                }
            };
            match frame {
                Frame::FilePutChunk { data } => {
                    if data.is_empty() {
                        continue;
                    }
                    if let Err(e) = file.write_all(&data) {
                        self.send_error(writer, &format!("write {:?} failed: {}", path, e));
                        return;
                    }
                    written += data.len() as u64;
                }
                Frame::FilePutClose => {
                    debug!(path, bytes = written, "upload complete");
                    let _ = writer.send(&Frame::FilePutResult {
                        bytes: written,
                        error: None,
                    });
                    return;
                }
                other => {
                    self.send_error(
                        writer,
                        &format!("unexpected {} frame during upload", other.type_name()),
                    );
                    return;
                }
            }
        }
    }

    fn handle_file_get(&self, writer: &ConnWriter, path: &str) {
        if path.is_empty() {
            self.send_error(writer, "path is required");
            return;
        }
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                self.send_error(writer, &format!("open {:?} failed: {}", path, e));
                return;
            }
        };

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        loop {
            match file.read(&mut buf) {
                Ok(0) => {
                    debug!(path, bytes = sent, "download complete");
                    let _ = writer.send(&Frame::FileGetResult {
                        bytes: sent,
                        error: None,
                    });
                    return;
                }
                Ok(n) => {
                    sent += n as u64;
                    if writer
                        .send(&Frame::FileGetChunk {
                            data: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = writer.send(&Frame::FileGetResult {
                        bytes: sent,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            }
        }
    }

    fn send_error(&self, writer: &ConnWriter, message: &str) {
        if let Err(e) = writer.send(&Frame::Error {
            message: message.to_string(),
        }) {
            debug!(error = %e, "error frame lost, peer gone");
        }
    }
}

/// Why the stdin pump stopped.
enum StdinEnd {
    /// The client sent `stdin_close` or an unexpected frame.
    Closed,
    /// The connection ended before `stdin_close`. Either the exec path
    /// forced it via `shutdown_read` after child exit, or the peer is gone.
    ConnectionLost,
}

/// Consume stdin frames from the connection, feeding the child.
///
/// `ping` is answered inline and does not end the pump.
fn consume_stdin(reader: &mut ConnReader, writer: &ConnWriter, mut stdin: ChildStdin) -> StdinEnd {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(_) => return StdinEnd::ConnectionLost,
        };
        match frame {
            Frame::StdinChunk { data } => {
                if !data.is_empty() {
                    // write errors mean the child closed stdin; keep
                    // consuming frames so the client is not blocked
                    let _ = stdin.write_all(&data);
                    let _ = stdin.flush();
                }
            }
            Frame::StdinClose => return StdinEnd::Closed,
            Frame::Ping => {
                let _ = writer.send(&Frame::Pong {
                    timestamp_ms: epoch_millis(),
                });
            }
            other => {
                debug!(frame = other.type_name(), "unexpected frame during exec");
                return StdinEnd::Closed;
            }
        }
    }
}

/// Wait for the child, enforcing the deadline by killing its process group.
fn wait_child(child: &mut Child, deadline: Option<Instant>) -> io::Result<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        warn!(pid = child.id(), "deadline exceeded, killing process group");
                        kill_process_group(child.id());
                        return child.wait();
                    }
                }
                thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Exit code following shell conventions: `128 + signal` for signal deaths.
fn exit_code_from_status(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: kill(2) with a negative pid signals the whole group.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
