//! A minimal, synchronous RESP encoder/decoder.
//!
//! This is *not* the `Protocol Codec` SPEC_FULL.md assigns to the
//! out-of-scope Connection Layer: it has no notion of partial reads over
//! a non-blocking socket, no inline-command fallback, and no pipelining.
//! It exists only so the AOF pipeline can read back the bytes it wrote
//! (§4.8) and the replication state machine can speak the handshake and
//! decode the streamed command payload (§4.9) — both of which are
//! defined purely in terms of RESP bytes, independent of whatever socket
//! abstraction eventually owns the bytes.

use bytes::Bytes;

use crate::error::ServerError;
use crate::CmdLine;

/// One decoded RESP value. Unlike [`crate::Reply`] this also represents
/// the shapes a *master* sends a *slave* (status lines, raw bulk RDB
/// payloads) that never originate from a command executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Interpret this frame as a command line: an array of bulk strings.
    pub fn into_cmd_line(self) -> Result<CmdLine, ServerError> {
        match self {
            Frame::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Frame::Bulk(Some(b)) => Ok(b),
                    other => Err(ServerError::Protocol(format!(
                        "expected bulk string in command array, got {other:?}"
                    ))),
                })
                .collect(),
            other => Err(ServerError::Protocol(format!(
                "expected multi-bulk command array, got {other:?}"
            ))),
        }
    }

    pub fn is_ok_status(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }
}

/// Encode a command line as a RESP multi-bulk array of bulk strings —
/// the on-wire form used both by the AOF file and by replication
/// streaming.
pub fn encode_cmd_line(cmd: &CmdLine) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b'*');
    buf.extend_from_slice(cmd.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for arg in cmd {
        buf.push(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Encode a bare simple-string command (used for the handshake, e.g.
/// `PING`, `AUTH <pw>`) the same way `encode_cmd_line` would, given the
/// argument list.
pub fn encode_inline(args: &[&str]) -> Vec<u8> {
    let cmd: CmdLine = args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect();
    encode_cmd_line(&cmd)
}

/// Incremental frame decoder over an accumulating byte buffer. Bytes
/// arrive via [`Decoder::feed`]; completed frames are drained via
/// [`Decoder::next_frame`]. This mirrors the `masterChan := parser.ParseStream(conn)`
/// shape in `original_source/database/replication.go`, minus the
/// goroutine/channel plumbing (callers here drive it from their own
/// async read loop).
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    pos: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drop already-consumed bytes to bound memory growth; call
    /// periodically between frames, not mid-frame.
    pub fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(0..self.pos);
            self.pos = 0;
        }
    }

    /// Attempt to decode one complete frame from the buffered bytes.
    /// Returns `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ServerError> {
        let start = self.pos;
        match parse_frame(&self.buf, start) {
            Ok(Some((frame, consumed))) => {
                self.pos = consumed;
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Convenience used by AOF replay: decode every complete frame
    /// currently buffered, interpreting each as a command line.
    pub fn drain_cmd_lines(&mut self) -> Result<Vec<CmdLine>, ServerError> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame()? {
            out.push(frame.into_cmd_line()?);
        }
        self.compact();
        Ok(out)
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Returns `Ok(Some((frame, next_pos)))`, `Ok(None)` if incomplete, or
/// `Err` on a malformed frame.
fn parse_frame(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, ServerError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let tag = buf[pos];
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[pos + 1..line_end])
        .map_err(|_| ServerError::Protocol("non-utf8 line".to_string()))?;
    let after_line = line_end + 2;

    match tag {
        b'+' => Ok(Some((Frame::Simple(line.to_string()), after_line))),
        b'-' => Ok(Some((Frame::Error(line.to_string()), after_line))),
        b':' => {
            let n: i64 = line
                .parse()
                .map_err(|_| ServerError::Protocol(format!("bad integer '{line}'")))?;
            Ok(Some((Frame::Integer(n), after_line)))
        }
        b'$' => {
            let len: i64 = line
                .parse()
                .map_err(|_| ServerError::Protocol(format!("bad bulk length '{line}'")))?;
            if len < 0 {
                return Ok(Some((Frame::Bulk(None), after_line)));
            }
            let len = len as usize;
            let data_end = after_line + len;
            if buf.len() < data_end + 2 {
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&buf[after_line..data_end]);
            Ok(Some((Frame::Bulk(Some(data)), data_end + 2)))
        }
        b'*' => {
            let count: i64 = line
                .parse()
                .map_err(|_| ServerError::Protocol(format!("bad array length '{line}'")))?;
            if count < 0 {
                return Ok(Some((Frame::Array(None), after_line)));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut cursor = after_line;
            for _ in 0..count {
                match parse_frame(buf, cursor)? {
                    Some((frame, next)) => {
                        items.push(frame);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(Some(items)), cursor)))
        }
        other => Err(ServerError::Protocol(format!(
            "unexpected frame tag '{}'",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_command_line() {
        let cmd: CmdLine = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")];
        let bytes = encode_cmd_line(&cmd);
        let mut dec = Decoder::new();
        dec.feed(&bytes);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.into_cmd_line().unwrap(), cmd);
    }

    #[test]
    fn reports_incomplete_frame() {
        let mut dec = Decoder::new();
        dec.feed(b"*2\r\n$3\r\nSET\r\n$1\r\n");
        assert_eq!(dec.next_frame().unwrap(), None);
        dec.feed(b"k\r\n");
        assert!(dec.next_frame().unwrap().is_some());
    }

    #[test]
    fn decodes_status_and_error_lines() {
        let mut dec = Decoder::new();
        dec.feed(b"+FULLRESYNC abc123 100\r\n-NOAUTH please\r\n");
        assert_eq!(
            dec.next_frame().unwrap(),
            Some(Frame::Simple("FULLRESYNC abc123 100".to_string()))
        );
        assert_eq!(
            dec.next_frame().unwrap(),
            Some(Frame::Error("NOAUTH please".to_string()))
        );
    }

    #[test]
    fn drains_multiple_buffered_commands() {
        let mut dec = Decoder::new();
        let a: CmdLine = vec![Bytes::from_static(b"PING")];
        let b: CmdLine = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"a"), Bytes::from_static(b"1")];
        dec.feed(&encode_cmd_line(&a));
        dec.feed(&encode_cmd_line(&b));
        let lines = dec.drain_cmd_lines().unwrap();
        assert_eq!(lines, vec![a, b]);
    }
}
