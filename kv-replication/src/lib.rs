//! Master/slave replication (C9): the slave's handshake/streaming state
//! machine and the master's replica fan-out, ported from
//! `original_source/database/replication.go`.
//!
//! A server wires exactly one side in depending on its role at startup:
//! a plain server constructs [`kv_engine::multi_db::NoopReplicationControl`]
//! and never links `slave`'s networking code into its hot path; a server
//! that might become a slave constructs a [`SlaveReplication`] instead.
//! The master side ([`MasterReplicas`]) is independent of which
//! `ReplicationControl` a server runs — any server can have replicas
//! attach to it.

pub mod master;
pub mod slave;

pub use master::{handle_psync, handle_replconf, MasterReplicas};
pub use slave::{SlaveConfig, SlaveReplication};
