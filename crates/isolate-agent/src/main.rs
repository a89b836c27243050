//! agentd - the isolate command execution daemon.
//!
//! Listens on a Unix domain socket and/or an AF_VSOCK port, executes child
//! processes on behalf of connected clients, and streams their output back
//! over the frame protocol. When both endpoints are given, two accept loops
//! share one server instance.

use clap::Parser;
use isolate_agent::{Server, ServerConfig};
use isolate_protocol::transport::{Listener, UnixEndpoint, VsockEndpoint};
use isolate_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RESULT_BUFFER};
use std::ffi::CString;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Unix socket path to unlink from the signal handler, if one was bound.
static SOCKET_PATH: OnceLock<CString> = OnceLock::new();

/// isolate command execution agent
#[derive(Parser, Debug)]
#[command(name = "agentd")]
#[command(about = "Command execution agent for sandboxed workloads")]
#[command(version)]
struct Args {
    /// Unix domain socket path to listen on
    #[arg(long)]
    unix: Option<PathBuf>,

    /// AF_VSOCK port to listen on (Linux guests)
    #[arg(long = "vsock-port")]
    vsock_port: Option<u32>,

    /// Chunk size in bytes for stdout/stderr streaming
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk: usize,

    /// Maximum bytes retained per stream in the final result
    #[arg(long = "max-buffer", default_value_t = DEFAULT_MAX_RESULT_BUFFER)]
    max_buffer: usize,

    /// Restrict execution and working directories to this root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Disable chroot isolation (insecure for untrusted scripts)
    #[arg(long = "no-chroot")]
    no_chroot: bool,

    /// Allow script interpreters without chroot isolation (insecure, dev only)
    #[arg(long = "allow-insecure")]
    allow_insecure: bool,
}

fn main() {
    let args = Args::parse();
    init_logging();

    if args.unix.is_none() && args.vsock_port.is_none() {
        eprintln!("agentd requires --unix or --vsock-port");
        std::process::exit(1);
    }

    let server = match Server::new(ServerConfig {
        chunk_size: args.chunk,
        max_result_buffer: args.max_buffer,
        root_dir: args.root.clone(),
        use_chroot_if_root: args.root.is_some() && !args.no_chroot,
        allow_insecure: args.allow_insecure,
    }) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "server setup failed");
            eprintln!("agentd: {}", e);
            std::process::exit(1);
        }
    };

    let (fatal_tx, fatal_rx) = mpsc::channel();
    let mut listener_count = 0;

    if let Some(path) = &args.unix {
        let listener = match UnixEndpoint::new(path).listen() {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, path = %path.display(), "unix listener bind failed");
                std::process::exit(1);
            }
        };
        info!(path = %path.display(), "listening on unix socket");
        remember_socket_path(path);
        spawn_accept_loop(Arc::clone(&server), listener, fatal_tx.clone());
        listener_count += 1;
    }

    if let Some(port) = args.vsock_port {
        let listener = match VsockEndpoint::new(0, port).listen() {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, port, "vsock listener bind failed");
                std::process::exit(1);
            }
        };
        info!(port, "listening on vsock port");
        spawn_accept_loop(Arc::clone(&server), listener, fatal_tx.clone());
        listener_count += 1;
    }

    install_signal_handlers();
    info!(listeners = listener_count, "agentd ready");

    // Block until a listener dies; clean shutdown arrives via the signal
    // handler, which unlinks the socket and exits 0 directly.
    if let Ok(e) = fatal_rx.recv() {
        error!(error = %e, "fatal listener error");
        if let Some(path) = &args.unix {
            let _ = std::fs::remove_file(path);
        }
        std::process::exit(1);
    }
}

fn spawn_accept_loop(
    server: Arc<Server>,
    listener: Box<dyn Listener>,
    fatal_tx: mpsc::Sender<std::io::Error>,
) {
    std::thread::Builder::new()
        .name("accept".into())
        .spawn(move || {
            if let Err(e) = server.serve(listener.as_ref()) {
                let _ = fatal_tx.send(e);
            }
        })
        .expect("spawn accept thread");
}

#[cfg(unix)]
fn remember_socket_path(path: &std::path::Path) {
    use std::os::unix::ffi::OsStrExt;
    if let Ok(cstr) = CString::new(path.as_os_str().as_bytes()) {
        let _ = SOCKET_PATH.set(cstr);
    }
}

#[cfg(not(unix))]
fn remember_socket_path(_path: &std::path::Path) {}

/// Exit cleanly on SIGINT/SIGTERM, removing the unix socket first.
///
/// The handler only calls unlink(2) and _exit(2), both async-signal-safe.
#[cfg(unix)]
fn install_signal_handlers() {
    // SAFETY: the handler restricts itself to async-signal-safe calls on a
    // CString that was fully initialized before the handler was installed.
    unsafe extern "C" fn handle_term_signal(_sig: libc::c_int) {
        if let Some(path) = SOCKET_PATH.get() {
            libc::unlink(path.as_ptr());
        }
        libc::_exit(0);
    }

    // SAFETY: installing a handler with a valid function pointer.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            handle_term_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            handle_term_signal as *const () as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("isolate_agent=info,agentd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
