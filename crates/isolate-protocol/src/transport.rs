//! Transport endpoints for the frame protocol.
//!
//! Two interchangeable stream transports: Unix domain sockets and AF_VSOCK
//! (Linux only). Both provide ordered, reliable byte streams; the frame
//! codec runs on top of either unchanged.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Default time a dialer blocks waiting for a connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Well-known vsock CIDs.
pub mod cid {
    /// Host CID (always 2).
    pub const HOST: u32 = 2;
    /// First guest CID.
    pub const GUEST: u32 = 3;
    /// Any CID (for listening).
    pub const ANY: u32 = u32::MAX;
}

/// One end of an established transport connection.
///
/// Implementations share a single OS-level stream between clones, so a
/// `shutdown` on any handle unblocks reads and writes on all of them. That
/// is the cancellation mechanism both the client and the server rely on.
pub trait Conn: Read + Write + Send {
    /// Clone the handle (shares the underlying stream).
    fn try_clone(&self) -> io::Result<Box<dyn Conn>>;

    /// Close the read half; blocked and future reads observe EOF.
    fn shutdown_read(&self) -> io::Result<()>;

    /// Close both halves.
    fn shutdown(&self) -> io::Result<()>;

    /// Set or clear the read timeout.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Conn")
    }
}

/// A bound transport listener accepting [`Conn`]s.
pub trait Listener: Send + Sync {
    /// Block until the next connection arrives.
    fn accept(&self) -> io::Result<Box<dyn Conn>>;

    /// Human-readable bind address, for logs.
    fn addr_label(&self) -> String;
}

/// A dialable agent endpoint.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Unix domain socket endpoint.
    Unix(UnixEndpoint),
    /// AF_VSOCK endpoint (Linux only).
    Vsock(VsockEndpoint),
}

impl Endpoint {
    /// Shorthand for a Unix endpoint with default dial timeout.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(UnixEndpoint::new(path))
    }

    /// Shorthand for a vsock endpoint with default dial timeout.
    pub fn vsock(cid: u32, port: u32) -> Self {
        Endpoint::Vsock(VsockEndpoint::new(cid, port))
    }

    /// Dial the endpoint, blocking up to its configured timeout.
    pub fn dial(&self) -> io::Result<Box<dyn Conn>> {
        match self {
            Endpoint::Unix(ep) => ep.dial(),
            Endpoint::Vsock(ep) => ep.dial(),
        }
    }

    /// Human-readable address, for logs and error messages.
    pub fn addr_label(&self) -> String {
        match self {
            Endpoint::Unix(ep) => format!("unix:{}", ep.path.display()),
            Endpoint::Vsock(ep) => format!("vsock:{}:{}", ep.cid, ep.port),
        }
    }
}

// ============================================================================
// Unix domain sockets
// ============================================================================

/// A Unix domain socket endpoint.
#[derive(Debug, Clone)]
pub struct UnixEndpoint {
    /// Socket path on the local filesystem.
    pub path: PathBuf,
    /// How long `dial` blocks before giving up.
    pub dial_timeout: Duration,
}

impl UnixEndpoint {
    /// Create an endpoint with the default dial timeout.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Override the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Connect to the socket, blocking up to the dial timeout.
    #[cfg(unix)]
    pub fn dial(&self) -> io::Result<Box<dyn Conn>> {
        let stream = unix_impl::connect_timeout(&self.path, self.dial_timeout)?;
        Ok(Box::new(stream))
    }

    /// Unix sockets are unavailable on this platform.
    #[cfg(not(unix))]
    pub fn dial(&self) -> io::Result<Box<dyn Conn>> {
        Err(unsupported("unix sockets"))
    }

    /// Bind a listener, removing a stale socket file first.
    #[cfg(unix)]
    pub fn listen(&self) -> io::Result<Box<dyn Listener>> {
        let _ = std::fs::remove_file(&self.path);
        let listener = std::os::unix::net::UnixListener::bind(&self.path)?;
        Ok(Box::new(UnixSocketListener {
            listener,
            path: self.path.clone(),
        }))
    }

    /// Unix sockets are unavailable on this platform.
    #[cfg(not(unix))]
    pub fn listen(&self) -> io::Result<Box<dyn Listener>> {
        Err(unsupported("unix sockets"))
    }
}

#[cfg(unix)]
struct UnixSocketListener {
    listener: std::os::unix::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl Listener for UnixSocketListener {
    fn accept(&self) -> io::Result<Box<dyn Conn>> {
        let (stream, _) = self.listener.accept()?;
        Ok(Box::new(stream))
    }

    fn addr_label(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(unix)]
impl Conn for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Box<dyn Conn>> {
        let clone = std::os::unix::net::UnixStream::try_clone(self)?;
        Ok(Box::new(clone))
    }

    fn shutdown_read(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Read)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, std::net::Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::poll_writable;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::time::Duration;

    /// Connect with a real timeout. The stdlib `UnixStream::connect` has no
    /// timeout parameter, so this drives a non-blocking connect by hand.
    pub fn connect_timeout(path: &Path, timeout: Duration) -> io::Result<UnixStream> {
        let bytes = path.as_os_str().as_bytes();

        // SAFETY: zeroed sockaddr_un is a valid all-defaults value.
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        if bytes.len() >= addr.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket path too long",
            ));
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        // SAFETY: plain socket(2) call, fd ownership taken immediately.
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created, owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        set_nonblocking(fd.as_raw_fd(), true)?;

        let addr_len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1)
            as libc::socklen_t;
        // SAFETY: addr is a fully initialized sockaddr_un of addr_len bytes.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {
                    poll_writable(fd.as_raw_fd(), timeout)?;
                    check_so_error(fd.as_raw_fd())?;
                }
                _ => return Err(err),
            }
        }

        set_nonblocking(fd.as_raw_fd(), false)?;
        Ok(UnixStream::from(fd))
    }

    pub fn set_nonblocking(fd: libc::c_int, nonblocking: bool) -> io::Result<()> {
        // SAFETY: fcntl on a valid fd.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn check_so_error(fd: libc::c_int) -> io::Result<()> {
        let mut so_error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: getsockopt writes at most `len` bytes into so_error.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if so_error != 0 {
            return Err(io::Error::from_raw_os_error(so_error));
        }
        Ok(())
    }
}

/// Wait until `fd` becomes writable, failing with `TimedOut` on expiry.
#[cfg(unix)]
fn poll_writable(fd: libc::c_int, timeout: Duration) -> io::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd array of length 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out"));
        }
        return Ok(());
    }
}

#[cfg(not(unix))]
fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} not supported on this platform", what),
    )
}

// ============================================================================
// AF_VSOCK
// ============================================================================

/// An AF_VSOCK endpoint (CID + port).
#[derive(Debug, Clone, Copy)]
pub struct VsockEndpoint {
    /// Peer CID for dialing; ignored when listening.
    pub cid: u32,
    /// Port number.
    pub port: u32,
    /// How long `dial` blocks before giving up.
    pub dial_timeout: Duration,
}

impl VsockEndpoint {
    /// Create an endpoint with the default dial timeout.
    pub fn new(cid: u32, port: u32) -> Self {
        Self {
            cid,
            port,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Override the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Connect to the peer, blocking up to the dial timeout.
    #[cfg(target_os = "linux")]
    pub fn dial(&self) -> io::Result<Box<dyn Conn>> {
        let stream = vsock_impl::VsockStream::connect(self.cid, self.port, self.dial_timeout)?;
        Ok(Box::new(stream))
    }

    /// vsock is only supported on Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn dial(&self) -> io::Result<Box<dyn Conn>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock only supported on Linux",
        ))
    }

    /// Bind a listener on the port (any CID).
    #[cfg(target_os = "linux")]
    pub fn listen(&self) -> io::Result<Box<dyn Listener>> {
        let listener = vsock_impl::VsockListener::bind(self.port)?;
        Ok(Box::new(listener))
    }

    /// vsock is only supported on Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn listen(&self) -> io::Result<Box<dyn Listener>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock only supported on Linux",
        ))
    }
}

#[cfg(target_os = "linux")]
mod vsock_impl {
    use super::{poll_writable, Conn, Listener};
    use crate::transport::cid;
    use std::io::{self, Read, Write};
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    const AF_VSOCK: libc::c_int = 40;

    #[repr(C)]
    struct sockaddr_vm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_zero: [u8; 4],
    }

    fn vsock_addr(cid_value: u32, port: u32) -> sockaddr_vm {
        sockaddr_vm {
            svm_family: AF_VSOCK as libc::sa_family_t,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: cid_value,
            svm_zero: [0; 4],
        }
    }

    fn new_socket() -> io::Result<OwnedFd> {
        // SAFETY: plain socket(2) call, fd ownership taken immediately.
        let fd = unsafe { libc::socket(AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created, owned descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// vsock listener.
    pub struct VsockListener {
        fd: OwnedFd,
        port: u32,
    }

    impl VsockListener {
        /// Create a new vsock listener on the given port.
        pub fn bind(port: u32) -> io::Result<Self> {
            let fd = new_socket()?;
            let addr = vsock_addr(cid::ANY, port);

            // SAFETY: addr is a fully initialized sockaddr_vm.
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const sockaddr_vm as *const libc::sockaddr,
                    mem::size_of::<sockaddr_vm>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: listen(2) on a bound socket.
            if unsafe { libc::listen(fd.as_raw_fd(), 16) } < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self { fd, port })
        }
    }

    impl Listener for VsockListener {
        fn accept(&self) -> io::Result<Box<dyn Conn>> {
            // SAFETY: accept(2) with null peer address (we don't need it).
            let fd = unsafe {
                libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd is a freshly accepted, owned descriptor.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            Ok(Box::new(VsockStream { fd }))
        }

        fn addr_label(&self) -> String {
            format!("vsock:*:{}", self.port)
        }
    }

    /// vsock stream (connection).
    pub struct VsockStream {
        fd: OwnedFd,
    }

    impl VsockStream {
        /// Connect to `cid:port`, blocking up to `timeout`.
        pub fn connect(cid_value: u32, port: u32, timeout: Duration) -> io::Result<Self> {
            let fd = new_socket()?;
            super::unix_impl::set_nonblocking(fd.as_raw_fd(), true)?;

            let addr = vsock_addr(cid_value, port);
            // SAFETY: addr is a fully initialized sockaddr_vm.
            let rc = unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    &addr as *const sockaddr_vm as *const libc::sockaddr,
                    mem::size_of::<sockaddr_vm>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {
                        poll_writable(fd.as_raw_fd(), timeout)?;
                        super::unix_impl::check_so_error(fd.as_raw_fd())?;
                    }
                    _ => return Err(err),
                }
            }

            super::unix_impl::set_nonblocking(fd.as_raw_fd(), false)?;
            Ok(Self { fd })
        }
    }

    impl Read for VsockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // SAFETY: read(2) into a buffer we own.
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }
    }

    impl Write for VsockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // SAFETY: write(2) from a buffer we own.
            let n = unsafe {
                libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len())
            };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Conn for VsockStream {
        fn try_clone(&self) -> io::Result<Box<dyn Conn>> {
            let fd = self.fd.try_clone()?;
            Ok(Box::new(VsockStream { fd }))
        }

        fn shutdown_read(&self) -> io::Result<()> {
            // SAFETY: shutdown(2) on a connected socket.
            if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RD) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn shutdown(&self) -> io::Result<()> {
            // SAFETY: shutdown(2) on a connected socket.
            if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            let tv = match timeout {
                Some(d) => libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                },
                None => libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                },
            };
            // SAFETY: setsockopt reads size_of::<timeval>() bytes from tv.
            let rc = unsafe {
                libc::setsockopt(
                    self.fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const libc::c_void,
                    mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}
