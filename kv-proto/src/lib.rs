//! Types shared between every layer of the engine: the RESP [`Reply`]
//! values a command produces, the [`ServerError`] taxonomy those replies
//! are built from, and a minimal internal RESP codec ([`resp`]) used only
//! by the AOF and replication pipelines to read back bytes this process
//! itself wrote.
//!
//! The full incremental, partial-read-tolerant wire codec a `Connection
//! Layer` would own is out of scope here (see SPEC_FULL.md §1); `resp`
//! is deliberately the smallest decoder that can frame a byte stream one
//! command at a time.

pub mod connection;
pub mod error;
pub mod reply;
pub mod resp;

/// A single command line: the command name followed by its arguments, as
/// raw bytes. This is the unit every layer above the codec operates on.
pub type CmdLine = Vec<bytes::Bytes>;

pub use connection::ConnectionSink;
pub use error::ServerError;
pub use reply::Reply;
