//! Length-prefixed JSON frame codec.

use crate::frame::Frame;
use crate::MAX_FRAME_SIZE;
use std::io::{self, BufReader, Read, Write};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Error decoding or transferring a wire frame.
#[derive(Debug)]
pub enum CodecError {
    /// The peer closed the stream cleanly between frames.
    Eof,
    /// Frame length header exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    /// JSON encode/decode error.
    Json(serde_json::Error),
    /// Underlying stream I/O error. A mid-frame EOF lands here as
    /// `UnexpectedEof`, which is a protocol error rather than a clean close.
    Io(io::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Eof => write!(f, "connection closed"),
            CodecError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            CodecError::Json(e) => write!(f, "frame encoding error: {}", e),
            CodecError::Io(e) => write!(f, "frame io error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

impl CodecError {
    /// True for clean end-of-stream (no partial frame was consumed).
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Eof)
    }
}

/// Encode a frame to wire format (length-prefixed JSON).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(frame).map_err(CodecError::Json)?;
    let len = body.len() as u32;

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);

    Ok(buf)
}

/// Current wall-clock time as Unix epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reads frames off a byte stream.
pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a stream in a buffered frame reader.
    pub fn new(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Block until one complete frame arrives or the stream ends.
    ///
    /// Returns [`CodecError::Eof`] only when the stream closes on a frame
    /// boundary; an EOF mid-header or mid-body is an I/O error.
    pub fn read_frame(&mut self) -> Result<Frame, CodecError> {
        let mut header = [0u8; 4];
        self.read_full(&mut header, true)?;
        let len = u32::from_be_bytes(header) as usize;

        if len > MAX_FRAME_SIZE as usize {
            return Err(CodecError::TooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.read_full(&mut body, false)?;

        serde_json::from_slice(&body).map_err(CodecError::Json)
    }

    /// Fill `buf` completely, distinguishing a clean close before the first
    /// byte (`eof_ok`) from a truncated frame.
    fn read_full(&mut self, buf: &mut [u8], eof_ok: bool) -> Result<(), CodecError> {
        let mut pos = 0;
        while pos < buf.len() {
            match self.inner.read(&mut buf[pos..]) {
                Ok(0) => {
                    if pos == 0 && eof_ok {
                        return Err(CodecError::Eof);
                    }
                    return Err(CodecError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed mid-frame",
                    )));
                }
                Ok(n) => pos += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
        Ok(())
    }
}

/// Writes frames onto a byte stream.
///
/// The writer serializes whole records under an internal mutex, so multiple
/// producer threads (e.g. the stdout and stderr pumps of one connection) can
/// share one writer without interleaving partial frames.
pub struct FrameWriter<W: Write> {
    inner: Mutex<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a stream in a frame writer.
    pub fn new(stream: W) -> Self {
        Self {
            inner: Mutex::new(stream),
        }
    }

    /// Serialize `frame` and flush it as one atomic record.
    pub fn send(&self, frame: &Frame) -> Result<(), CodecError> {
        let buf = encode_frame(frame)?;
        let mut stream = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stream.write_all(&buf)?;
        stream.flush()?;
        Ok(())
    }

    /// Consume the writer, returning the underlying stream.
    pub fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ExecRequest;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = Frame::ExecRequest(ExecRequest {
            path: "/bin/echo".into(),
            args: vec!["hello".into()],
            stream: true,
            ..Default::default()
        });

        let encoded = encode_frame(&frame).unwrap();
        let mut reader = FrameReader::new(Cursor::new(encoded));
        let decoded = reader.read_frame().unwrap();

        let Frame::ExecRequest(req) = decoded else {
            panic!("expected exec_request, got {:?}", decoded);
        };
        assert_eq!(req.path, "/bin/echo");
        assert_eq!(req.args, vec!["hello".to_string()]);
        assert!(req.stream);
    }

    #[test]
    fn test_several_frames_back_to_back() {
        let mut wire = encode_frame(&Frame::Ping).unwrap();
        wire.extend(encode_frame(&Frame::StdinChunk { data: vec![1, 2, 3] }).unwrap());
        wire.extend(encode_frame(&Frame::StdinClose).unwrap());

        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(reader.read_frame().unwrap(), Frame::Ping));
        let Frame::StdinChunk { data } = reader.read_frame().unwrap() else {
            panic!("expected stdin_chunk");
        };
        assert_eq!(data, vec![1, 2, 3]);
        assert!(matches!(reader.read_frame().unwrap(), Frame::StdinClose));
        assert!(reader.read_frame().unwrap_err().is_eof());
    }

    #[test]
    fn test_clean_eof_on_frame_boundary() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(reader.read_frame(), Err(CodecError::Eof)));
    }

    #[test]
    fn test_truncated_header_is_protocol_error() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0]));
        match reader.read_frame() {
            Err(CodecError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_body_is_protocol_error() {
        let mut wire = encode_frame(&Frame::Ping).unwrap();
        wire.truncate(wire.len() - 1);
        let mut reader = FrameReader::new(Cursor::new(wire));
        match reader.read_frame() {
            Err(CodecError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut reader = FrameReader::new(Cursor::new(len.to_vec()));
        assert!(matches!(reader.read_frame(), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn test_malformed_body_rejected() {
        let body = b"not json at all";
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(body);
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(reader.read_frame(), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_writer_emits_whole_records_under_contention() {
        use std::sync::Arc;

        let writer = Arc::new(FrameWriter::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let writer = Arc::clone(&writer);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    writer
                        .send(&Frame::Stdout {
                            data: vec![i; 100],
                        })
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let wire = Arc::try_unwrap(writer)
            .ok()
            .expect("all senders joined")
            .into_inner();
        let mut reader = FrameReader::new(Cursor::new(wire));
        let mut count = 0;
        loop {
            match reader.read_frame() {
                Ok(Frame::Stdout { data }) => {
                    // every record must be internally consistent
                    assert_eq!(data.len(), 100);
                    assert!(data.iter().all(|&b| b == data[0]));
                    count += 1;
                }
                Ok(other) => panic!("unexpected frame {:?}", other),
                Err(CodecError::Eof) => break,
                Err(e) => panic!("decode error: {}", e),
            }
        }
        assert_eq!(count, 8 * 50);
    }

    #[test]
    fn test_epoch_millis_is_recent() {
        // 2020-01-01 in epoch millis; anything earlier means a broken clock source
        assert!(epoch_millis() > 1_577_836_800_000);
    }
}
