//! The engine: one keyspace's data/TTL/version maps and dispatch (C4),
//! the multi-DB server and its command router (C5), the transaction
//! controller (C6), the pub/sub hub (C7), the command registry (C10),
//! and per-connection state (C13).
//!
//! Persistence (`kv-persist`) and replication (`kv-replication`) sit
//! above this crate: they call into it (`SingleDb::exec_with_lock` for
//! AOF replay, `MultiDb` swapping for a full resync) but this crate has
//! no knowledge of either.

pub mod commands;
pub mod conn;
pub mod db;
pub mod glob;
pub mod multi_db;
pub mod pubsub;
pub mod registry;
pub mod transaction;

pub use conn::{ConnRole, ConnState, MultiState};
pub use db::{AofSink, NoopAofSink, SingleDb};
pub use multi_db::MultiDb;
pub use pubsub::PubSubHub;
pub use registry::{CommandFlags, CommandSpec, Registry};
