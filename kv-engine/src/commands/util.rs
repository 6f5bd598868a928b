//! Small helpers shared by every command module: byte/string/number
//! parsing and the `prepare` shorthand for the common one-key cases.

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};

pub fn key_of(b: &Bytes) -> String {
    String::from_utf8_lossy(b).to_string()
}

pub fn bytes_to_string(b: &Bytes) -> String {
    String::from_utf8_lossy(b).to_string()
}

pub fn parse_i64(b: &Bytes) -> Result<i64, ServerError> {
    bytes_to_string(b)
        .parse::<i64>()
        .map_err(|_| ServerError::Range("value is not an integer or out of range".to_string()))
}

pub fn parse_f64(b: &Bytes) -> Result<f64, ServerError> {
    bytes_to_string(b)
        .parse::<f64>()
        .map_err(|_| ServerError::Range("value is not a valid float".to_string()))
}

/// `prepare` for a command whose only key is `args[0]`, declared for a
/// write.
pub fn single_write(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0])], vec![])
}

/// `prepare` for a command whose only key is `args[0]`, declared for a
/// read.
pub fn single_read(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![], vec![key_of(&args[0])])
}

/// `prepare` for a command where every argument is a key to read
/// (`MGET`, `EXISTS`, ...).
pub fn all_read(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![], args.iter().map(key_of).collect())
}

/// `prepare` for a command where every argument is a key to write
/// (`DEL`, ...).
pub fn all_write(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(key_of).collect(), vec![])
}

pub fn cmd_line(parts: Vec<impl Into<Vec<u8>>>) -> CmdLine {
    parts.into_iter().map(|p| Bytes::from(p.into())).collect()
}

pub fn ok_or_range<T>(result: Result<T, ServerError>) -> Result<T, Reply> {
    result.map_err(Reply::error)
}
