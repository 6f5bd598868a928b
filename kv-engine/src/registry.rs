//! The command registry (C10): name → `{executor, prepare, undo, arity,
//! flags}`, built once at startup via an explicit [`Registry::build`]
//! call rather than module-load side effects (§9 "Command registration
//! as process-wide state"), mirroring
//! `readyset-adapter::query_status_cache::QueryStatusCache::new()`'s
//! explicit-construction shape rather than a `ctor`/`inventory` registry.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply};

use crate::commands;
use crate::db::SingleDb;

/// Read-only or write, used by the slave-side read-only-mode filter
/// (§4.5 step 4) and to decide whether a command's argv is copied to the
/// AOF ingress channel after it commits (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags {
    pub write: bool,
}

pub type PrepareFn = fn(&[Bytes]) -> (Vec<String>, Vec<String>);
pub type ExecutorFn = fn(&SingleDb, &[Bytes]) -> Reply;
pub type UndoFn = fn(&SingleDb, &[Bytes]) -> Vec<CmdLine>;

/// One registry entry (§4.10).
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: i32,
    pub flags: CommandFlags,
    pub prepare: PrepareFn,
    pub executor: ExecutorFn,
    pub undo: Option<UndoFn>,
}

/// Name → [`CommandSpec`]. Read-mostly after [`Registry::build`]
/// returns; nothing ever mutates it again.
pub struct Registry {
    table: HashMap<String, CommandSpec>,
}

impl Registry {
    /// Populate every command module's entries. The one place command
    /// registration happens for the whole process.
    pub fn build() -> Self {
        let mut table = HashMap::new();
        commands::register_all(&mut table);
        Self { table }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Whether `name` is a registered read-only command (used by the
    /// slave-side read-only guard — unknown commands are not read-only).
    pub fn is_read_only(&self, name: &str) -> bool {
        self.table.get(name).map(|s| !s.flags.write).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_a_representative_command_from_every_category() {
        let r = Registry::build();
        for name in ["get", "set", "lpush", "hset", "sadd", "zadd", "del", "expire"] {
            assert!(r.contains(name), "missing command {name}");
        }
    }

    #[test]
    fn read_only_flag_matches_command_kind() {
        let r = Registry::build();
        assert!(r.is_read_only("get"));
        assert!(!r.is_read_only("set"));
        assert!(!r.is_read_only("nosuchcommand"));
    }
}
