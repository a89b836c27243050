//! Integration tests driving the agent server over a real unix socket with
//! raw protocol frames.

#![cfg(unix)]

use isolate_agent::{Server, ServerConfig};
use isolate_protocol::transport::{Conn, UnixEndpoint};
use isolate_protocol::{CodecError, ExecRequest, Frame, FrameReader, FrameWriter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

type TestReader = FrameReader<Box<dyn Conn>>;
type TestWriter = FrameWriter<Box<dyn Conn>>;

fn start_server(cfg: ServerConfig) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("agent.sock");
    let listener = UnixEndpoint::new(&sock).listen().unwrap();
    let server = Arc::new(Server::new(cfg).unwrap());
    std::thread::spawn(move || {
        let _ = server.serve(listener.as_ref());
    });
    (dir, sock)
}

fn connect(sock: &Path) -> (TestReader, TestWriter) {
    let conn = UnixEndpoint::new(sock).dial().unwrap();
    let reader = FrameReader::new(conn.try_clone().unwrap());
    let writer = FrameWriter::new(conn);
    (reader, writer)
}

fn exec_request(path: &str, args: &[&str]) -> ExecRequest {
    ExecRequest {
        path: path.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

struct ExecOutcome {
    streamed_stdout: Vec<u8>,
    streamed_stderr: Vec<u8>,
    stdout_frames: usize,
    result: Option<(i32, Vec<u8>, Vec<u8>)>,
    error: Option<String>,
}

/// Drain frames until the terminal record, then assert the connection
/// closes without further frames (exactly one terminal frame per exchange).
fn drain_exec(reader: &mut TestReader) -> ExecOutcome {
    let mut outcome = ExecOutcome {
        streamed_stdout: Vec::new(),
        streamed_stderr: Vec::new(),
        stdout_frames: 0,
        result: None,
        error: None,
    };
    loop {
        match reader.read_frame() {
            Ok(Frame::Stdout { data }) => {
                outcome.stdout_frames += 1;
                outcome.streamed_stdout.extend_from_slice(&data);
            }
            Ok(Frame::Stderr { data }) => outcome.streamed_stderr.extend_from_slice(&data),
            Ok(Frame::Result {
                exit_code,
                stdout,
                stderr,
                ..
            }) => {
                outcome.result = Some((exit_code, stdout, stderr));
                break;
            }
            Ok(Frame::Error { message }) => {
                outcome.error = Some(message);
                break;
            }
            Ok(other) => panic!("unexpected frame {:?}", other),
            Err(e) => panic!("read failed before terminal frame: {}", e),
        }
    }
    match reader.read_frame() {
        Err(CodecError::Eof) => {}
        other => panic!("expected connection close after terminal frame, got {:?}", other),
    }
    outcome
}

#[test]
fn test_ping_loops_then_exec_terminates_connection() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    for _ in 0..3 {
        writer.send(&Frame::Ping).unwrap();
        let Frame::Pong { timestamp_ms } = reader.read_frame().unwrap() else {
            panic!("expected pong");
        };
        assert!(timestamp_ms > 0);
    }

    writer
        .send(&Frame::ExecRequest(exec_request("/bin/echo", &["hi"])))
        .unwrap();
    writer.send(&Frame::StdinClose).unwrap();
    let outcome = drain_exec(&mut reader);
    let (exit_code, stdout, _) = outcome.result.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, b"hi\n");
}

#[test]
fn test_exec_nonzero_exit_is_a_result_not_an_error() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::ExecRequest(exec_request("/bin/sh", &["-c", "exit 42"])))
        .unwrap();
    writer.send(&Frame::StdinClose).unwrap();
    let outcome = drain_exec(&mut reader);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.unwrap().0, 42);
}

#[test]
fn test_exec_feeds_stdin_in_order() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::ExecRequest(exec_request("/bin/cat", &[])))
        .unwrap();
    writer
        .send(&Frame::StdinChunk {
            data: b"first ".to_vec(),
        })
        .unwrap();
    writer
        .send(&Frame::StdinChunk {
            data: b"second".to_vec(),
        })
        .unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    let (exit_code, stdout, _) = outcome.result.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, b"first second");
}

#[test]
fn test_ping_answered_during_running_exec() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::ExecRequest(exec_request("/bin/cat", &[])))
        .unwrap();
    writer.send(&Frame::Ping).unwrap();
    let Frame::Pong { .. } = reader.read_frame().unwrap() else {
        panic!("expected pong while child runs");
    };
    writer.send(&Frame::StdinClose).unwrap();
    let outcome = drain_exec(&mut reader);
    assert_eq!(outcome.result.unwrap().0, 0);
}

#[test]
fn test_stream_mode_preserves_chunk_order() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    let mut req = exec_request(
        "/bin/sh",
        &[
            "-c",
            "printf A; /bin/sleep 0.05; printf B; /bin/sleep 0.05; printf C",
        ],
    );
    req.stream = true;
    writer.send(&Frame::ExecRequest(req)).unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    assert_eq!(outcome.streamed_stdout, b"ABC");
    assert!(
        outcome.stdout_frames >= 2,
        "delayed writes should arrive as separate chunks, got {}",
        outcome.stdout_frames
    );
    let (exit_code, stdout, _) = outcome.result.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, b"ABC");
}

#[test]
fn test_buffer_cap_truncates_result_but_not_stream() {
    let (_dir, sock) = start_server(ServerConfig {
        max_result_buffer: 1024,
        ..Default::default()
    });
    let (mut reader, writer) = connect(&sock);

    let mut req = exec_request("/bin/sh", &["-c", "/usr/bin/head -c 4096 /dev/zero"]);
    req.stream = true;
    writer.send(&Frame::ExecRequest(req)).unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    assert_eq!(outcome.streamed_stdout.len(), 4096);
    let (_, stdout, _) = outcome.result.unwrap();
    assert_eq!(stdout.len(), 1024);
}

#[test]
fn test_stderr_and_stdout_kept_separate() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::ExecRequest(exec_request(
            "/bin/sh",
            &["-c", "printf out; printf err >&2"],
        )))
        .unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    let (_, stdout, stderr) = outcome.result.unwrap();
    assert_eq!(stdout, b"out");
    assert_eq!(stderr, b"err");
}

#[test]
fn test_deadline_kills_child_and_reports_signal_exit() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    let mut req = exec_request("/bin/sleep", &["5"]);
    req.timeout_ms = 100;
    let started = Instant::now();
    writer.send(&Frame::ExecRequest(req)).unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    assert!(
        started.elapsed() < Duration::from_millis(2000),
        "deadline did not fire promptly"
    );
    let (exit_code, _, _) = outcome.result.unwrap();
    assert_eq!(exit_code, 128 + libc::SIGKILL);
}

#[test]
fn test_spawn_failure_yields_error_frame() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::ExecRequest(exec_request(
            "/no/such/binary/anywhere",
            &[],
        )))
        .unwrap();
    let outcome = drain_exec(&mut reader);
    assert!(outcome.result.is_none());
    assert!(outcome.error.unwrap().contains("spawn failed"));
}

#[test]
fn test_env_reaches_child_without_agent_leakage() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    let mut env = BTreeMap::new();
    env.insert("MARKER".to_string(), "42".to_string());
    let mut req = exec_request("/usr/bin/env", &[]);
    req.env = env;
    writer.send(&Frame::ExecRequest(req)).unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    let (_, stdout, _) = outcome.result.unwrap();
    let text = String::from_utf8_lossy(&stdout);
    assert!(text.contains("MARKER=42"));
    assert!(
        !text.contains("PATH="),
        "agent environment must not leak into the child"
    );
}

// ----------------------------------------------------------------------------
// containment policy (root set, chroot off)
// ----------------------------------------------------------------------------

fn confined_server() -> (tempfile::TempDir, tempfile::TempDir, PathBuf, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let root_path = root.path().to_path_buf();
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("agent.sock");
    let listener = UnixEndpoint::new(&sock).listen().unwrap();
    let server = Arc::new(
        Server::new(ServerConfig {
            root_dir: Some(root_path.clone()),
            use_chroot_if_root: false,
            ..Default::default()
        })
        .unwrap(),
    );
    std::thread::spawn(move || {
        let _ = server.serve(listener.as_ref());
    });
    (root, dir, sock, root_path)
}

#[test]
fn test_escaping_argument_rejected_before_spawn() {
    let (_root, _dir, sock, root_path) = confined_server();
    let (mut reader, writer) = connect(&sock);

    let mut req = exec_request("/bin/cat", &["../etc/passwd"]);
    req.working_dir = root_path.to_string_lossy().into_owned();
    writer.send(&Frame::ExecRequest(req)).unwrap();

    let outcome = drain_exec(&mut reader);
    assert!(outcome.result.is_none());
    assert!(outcome.error.unwrap().contains("security violation"));
}

#[test]
fn test_contained_exec_reads_file_inside_root() {
    let (_root, _dir, sock, root_path) = confined_server();
    std::fs::write(root_path.join("safe.txt"), b"hello\n").unwrap();
    let (mut reader, writer) = connect(&sock);

    let mut req = exec_request("/bin/cat", &["safe.txt"]);
    req.working_dir = root_path.to_string_lossy().into_owned();
    writer.send(&Frame::ExecRequest(req)).unwrap();
    writer.send(&Frame::StdinClose).unwrap();

    let outcome = drain_exec(&mut reader);
    let (exit_code, stdout, stderr) = outcome.result.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(stdout, b"hello\n");
    assert!(stderr.is_empty());
}

#[test]
fn test_interpreter_refused_without_chroot() {
    let (_root, _dir, sock, _root_path) = confined_server();
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::ExecRequest(exec_request(
            "/usr/bin/python3",
            &["script.py"],
        )))
        .unwrap();
    let outcome = drain_exec(&mut reader);
    assert!(outcome.result.is_none());
    let message = outcome.error.unwrap();
    assert!(message.contains("security violation"));
    assert!(message.contains("interpreter"));
}

// ----------------------------------------------------------------------------
// protocol errors
// ----------------------------------------------------------------------------

#[test]
fn test_malformed_frame_answered_with_error() {
    use std::io::Write;

    let (_dir, sock) = start_server(ServerConfig::default());
    let mut conn = UnixEndpoint::new(&sock).dial().unwrap();
    let mut reader = FrameReader::new(conn.try_clone().unwrap());

    let body = b"{definitely not json";
    let mut wire = (body.len() as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(body);
    conn.write_all(&wire).unwrap();

    let Frame::Error { message } = reader.read_frame().unwrap() else {
        panic!("expected error frame");
    };
    assert!(message.contains("invalid frame"));
}

#[test]
fn test_unsupported_first_frame_answered_with_error() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::Stdout {
            data: b"backwards".to_vec(),
        })
        .unwrap();
    let Frame::Error { message } = reader.read_frame().unwrap() else {
        panic!("expected error frame");
    };
    assert!(message.contains("unsupported frame"));
}

// ----------------------------------------------------------------------------
// file transfer
// ----------------------------------------------------------------------------

#[test]
fn test_file_put_then_get_roundtrip() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("nested/dir/payload.bin");

    // deterministic pseudo-random payload, a bit over two chunks
    let mut payload = Vec::with_capacity(70_000);
    let mut state: u32 = 0x2545_f491;
    while payload.len() < 70_000 {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        payload.extend_from_slice(&state.to_le_bytes());
    }

    let (mut reader, writer) = connect(&sock);
    writer
        .send(&Frame::FilePutRequest {
            path: target.to_string_lossy().into_owned(),
            mode: 0o600,
        })
        .unwrap();
    for chunk in payload.chunks(32 * 1024) {
        writer
            .send(&Frame::FilePutChunk {
                data: chunk.to_vec(),
            })
            .unwrap();
    }
    writer.send(&Frame::FilePutClose).unwrap();

    let Frame::FilePutResult { bytes, error } = reader.read_frame().unwrap() else {
        panic!("expected file_put_result");
    };
    assert!(error.is_none());
    assert_eq!(bytes, payload.len() as u64);

    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(&target).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);

    // download it back on a fresh connection
    let (mut reader, writer) = connect(&sock);
    writer
        .send(&Frame::FileGetRequest {
            path: target.to_string_lossy().into_owned(),
        })
        .unwrap();

    let mut fetched = Vec::new();
    loop {
        match reader.read_frame().unwrap() {
            Frame::FileGetChunk { data } => fetched.extend_from_slice(&data),
            Frame::FileGetResult { bytes, error } => {
                assert!(error.is_none());
                assert_eq!(bytes, payload.len() as u64);
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(fetched, payload);
}

#[test]
fn test_file_put_overwrites_existing_file() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("f.txt");
    std::fs::write(&target, b"previous longer contents").unwrap();

    let (mut reader, writer) = connect(&sock);
    writer
        .send(&Frame::FilePutRequest {
            path: target.to_string_lossy().into_owned(),
            mode: 0,
        })
        .unwrap();
    writer
        .send(&Frame::FilePutChunk {
            data: b"new".to_vec(),
        })
        .unwrap();
    writer.send(&Frame::FilePutClose).unwrap();

    let Frame::FilePutResult { bytes, .. } = reader.read_frame().unwrap() else {
        panic!("expected file_put_result");
    };
    assert_eq!(bytes, 3);
    assert_eq!(std::fs::read(&target).unwrap(), b"new");
}

#[test]
fn test_file_get_missing_file_is_an_error() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::FileGetRequest {
            path: "/definitely/not/here.bin".into(),
        })
        .unwrap();
    let Frame::Error { message } = reader.read_frame().unwrap() else {
        panic!("expected error frame");
    };
    assert!(message.contains("open"));
}

#[test]
fn test_file_put_empty_path_rejected() {
    let (_dir, sock) = start_server(ServerConfig::default());
    let (mut reader, writer) = connect(&sock);

    writer
        .send(&Frame::FilePutRequest {
            path: String::new(),
            mode: 0,
        })
        .unwrap();
    let Frame::Error { message } = reader.read_frame().unwrap() else {
        panic!("expected error frame");
    };
    assert!(message.contains("path is required"));
}
