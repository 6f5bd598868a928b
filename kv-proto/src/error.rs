//! The error taxonomy from SPEC_FULL.md §7, as a `thiserror` enum.
//!
//! Lower layers (value containers, the sharded map) return their own
//! small, focused error types; at the point a result needs to become a
//! wire reply it is converted into a [`ServerError`], matching the
//! `From` ladder the teacher workspace uses for its own layered errors
//! (e.g. `mysql-time`'s `ConvertError`, `readyset-alloc`'s `ProfError`).

use thiserror::Error;

/// Every way a command can fail in a way that is visible to a client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Malformed frame from the codec. Connection-fatal on repeat.
    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Command name absent from the registry.
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    /// Arity mismatch.
    #[error("ERR wrong number of arguments for '{0}' command")]
    ArgNum(String),

    /// Option flags conflict or are malformed.
    #[error("ERR syntax error")]
    Syntax,

    /// Operation mismatched with the stored variant.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Integer/float parse failure or an out-of-range value.
    #[error("ERR {0}")]
    Range(String),

    /// NOAUTH / invalid password.
    #[error("NOAUTH Authentication required")]
    NoAuth,

    /// A password was supplied but did not match.
    #[error("ERR invalid password")]
    InvalidPassword,

    /// A write was attempted against a read-only slave.
    #[error("READONLY You can't write against a read only slave")]
    ReadOnlySlave,

    /// MULTI called while already in a transaction.
    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    /// EXEC called without a preceding MULTI.
    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    /// DISCARD called without a preceding MULTI.
    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,

    /// A queued command in the transaction failed; already rolled back.
    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    /// A command that cannot be queued (no `prepare`) was used in MULTI.
    #[error("ERR command '{0}' cannot be used in MULTI")]
    NotAllowedInMulti(String),

    /// A panic was recovered at the dispatcher boundary.
    #[error("ERR unknown error")]
    Unknown,

    /// Catch-all for a message that does not fit another variant but was
    /// produced with a specific, already-formatted RESP error body (used
    /// by command bodies that need a one-off error string, e.g.
    /// `-ERR no such key`).
    #[error("{0}")]
    Other(String),
}

impl ServerError {
    /// The literal text after the leading `-` and before the trailing
    /// `\r\n` of the RESP error line.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}
