//! RESP reply values, ported from `original_source/redis/protocol/{reply,errors,consts}.go`.
//!
//! A [`Reply`] is the one thing every executor returns (SPEC_FULL.md
//! §4.4): either a typed success value or a typed error, never a partial
//! result.

use crate::error::ServerError;

const CRLF: &str = "\r\n";

/// A single RESP-encodable reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK\r\n`-style simple string.
    Simple(String),
    /// `:123\r\n` integer.
    Integer(i64),
    /// `$n\r\n...\r\n` bulk string, or `$-1\r\n` when `None`.
    Bulk(Option<Vec<u8>>),
    /// `*n\r\n...` array of replies, or `*-1\r\n` when `None`.
    Array(Option<Vec<Reply>>),
    /// `-ERR ...\r\n` error.
    Error(ServerError),
    /// Nothing is written to the client (used for `SUBSCRIBE`-adjacent
    /// flows where a push message already carried the payload).
    NoReply,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    pub fn pong() -> Reply {
        Reply::Simple("PONG".to_string())
    }

    pub fn queued() -> Reply {
        Reply::Simple("QUEUED".to_string())
    }

    pub fn null_bulk() -> Reply {
        Reply::Bulk(None)
    }

    pub fn empty_array() -> Reply {
        Reply::Array(Some(Vec::new()))
    }

    /// The transaction-aborted-by-WATCH reply: a null array (`*-1\r\n`),
    /// distinct from an *empty* array.
    pub fn null_array() -> Reply {
        Reply::Array(None)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Reply {
        Reply::Bulk(Some(data.into()))
    }

    pub fn integer(n: i64) -> Reply {
        Reply::Integer(n)
    }

    pub fn array(items: Vec<Reply>) -> Reply {
        Reply::Array(Some(items))
    }

    pub fn error(err: ServerError) -> Reply {
        Reply::Error(err)
    }

    /// True for any [`Reply::Error`] — mirrors `protocol.IsErrorReply`.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(s) if s == "OK")
    }

    /// Serialize to the bytes that would be written to a client socket.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Reply::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Reply::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Reply::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
                for item in items {
                    item.encode_into(buf);
                }
            }
            Reply::Error(e) => {
                buf.push(b'-');
                buf.extend_from_slice(e.wire_message().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Reply::NoReply => {}
        }
    }
}

impl From<ServerError> for Reply {
    fn from(err: ServerError) -> Self {
        Reply::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ok() {
        assert_eq!(Reply::ok().to_bytes(), b"+OK\r\n");
    }

    #[test]
    fn encodes_null_bulk() {
        assert_eq!(Reply::null_bulk().to_bytes(), b"$-1\r\n");
    }

    #[test]
    fn encodes_null_array_distinct_from_empty() {
        assert_eq!(Reply::null_array().to_bytes(), b"*-1\r\n");
        assert_eq!(Reply::empty_array().to_bytes(), b"*0\r\n");
    }

    #[test]
    fn encodes_nested_array() {
        let r = Reply::array(vec![Reply::bulk("message"), Reply::bulk("ch"), Reply::integer(2)]);
        assert_eq!(
            r.to_bytes(),
            b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n:2\r\n".to_vec()
        );
    }

    #[test]
    fn error_is_error() {
        assert!(Reply::error(ServerError::WrongType).is_error());
        assert!(!Reply::ok().is_error());
    }
}
