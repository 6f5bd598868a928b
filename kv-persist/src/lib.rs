//! The AOF pipeline (C8): the ingress channel + writer thread that give
//! every mutating command eventual durability, the pause/rewrite
//! protocol that compacts the log online, and RDB snapshot
//! emission/loading, ported from `original_source/aof/{aof,rewrite,rdb}.go`.
//!
//! This crate is the concrete [`kv_engine::AofSink`] and
//! [`kv_engine::PersistenceHooks`] the `kv-server` binary wires into a
//! [`kv_engine::MultiDb`]; a server built with persistence disabled uses
//! `kv_engine`'s `NoopAofSink`/`NoopPersistenceHooks` instead and never
//! links this crate's file-handling code into its hot path.

mod aof;
mod crc64;
mod rdb;
mod replay;

pub use aof::{AofConfig, AofHandler, FanOutAofSink};
pub use rdb::{load_rdb, load_rdb_bytes, save_rdb, save_rdb_bytes, LoadedDb, LoadedKey};
pub use replay::replay_aof_file;
