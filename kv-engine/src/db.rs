//! The single-DB engine (C4): one keyspace's data/TTL/version maps, the
//! key-lock table, and the dispatch algorithm from SPEC_FULL.md §4.4,
//! ported from `original_source/database/single_db.go`.

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};
use kv_store::lock_table::MultiGuard;
use kv_store::{KeyLockTable, ShardedMap, TimeWheel};
use kv_types::Entity;

use crate::conn::{ConnState, MultiState};
use crate::registry::{CommandSpec, Registry};
use crate::transaction;

/// Default shard count for the data map (§4.1).
pub const DEFAULT_DATA_SHARDS: usize = 65_536;
/// Default shard count for the TTL and version maps (§4.1).
pub const DEFAULT_TTL_SHARDS: usize = 1_024;
/// Default key-lock table size (§4.2).
pub const DEFAULT_LOCK_TABLE_SIZE: usize = 1_024;

/// Destination for a copy of every mutating command, handed to the AOF
/// pipeline. `kv-persist` provides the real implementation; tests and a
/// disabled-AOF configuration use [`NoopAofSink`].
pub trait AofSink: Send + Sync {
    fn append(&self, db_index: usize, cmd: CmdLine);
}

pub struct NoopAofSink;

impl AofSink for NoopAofSink {
    fn append(&self, _db_index: usize, _cmd: CmdLine) {}
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

fn ascii_lowercase(b: &Bytes) -> String {
    String::from_utf8_lossy(b).to_ascii_lowercase()
}

fn validate_arity(arity: i32, argc: i64) -> bool {
    if arity >= 0 {
        argc == arity as i64
    } else {
        argc >= -arity as i64
    }
}

pub struct SingleDb {
    index: usize,
    data: ShardedMap<Entity>,
    ttl: ShardedMap<i64>,
    version: ShardedMap<u32>,
    locker: KeyLockTable,
    registry: Arc<Registry>,
    aof: Arc<dyn AofSink>,
    time_wheel: Arc<TimeWheel>,
    /// A weak handle to this DB's own `Arc`, so expiry callbacks
    /// scheduled on the time wheel can re-enter `self` without the
    /// caller needing to hold (or pass down) an `Arc<SingleDb>` —
    /// executors only ever see a bare `&SingleDb`.
    self_weak: Weak<SingleDb>,
}

impl SingleDb {
    pub fn new(
        index: usize,
        registry: Arc<Registry>,
        aof: Arc<dyn AofSink>,
        time_wheel: Arc<TimeWheel>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            index,
            data: ShardedMap::new(DEFAULT_DATA_SHARDS),
            ttl: ShardedMap::new(DEFAULT_TTL_SHARDS),
            version: ShardedMap::new(DEFAULT_TTL_SHARDS),
            locker: KeyLockTable::new(DEFAULT_LOCK_TABLE_SIZE),
            registry,
            aof,
            time_wheel,
            self_weak: weak.clone(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn expiry_job_key(key: &str) -> String {
        format!("expired:{key}")
    }

    /// Returns `true` if the key was present but has now been removed
    /// because its TTL elapsed. Mirrors the lazy-expiration check that
    /// runs on every `GetEntity`.
    fn check_and_expire(&self, key: &str) -> bool {
        let Some(exp) = self.ttl.get(key) else {
            return false;
        };
        if now_millis() <= exp {
            return false;
        }
        self.data.remove(key);
        self.ttl.remove(key);
        self.time_wheel.cancel(&Self::expiry_job_key(key));
        true
    }

    pub fn get_entity(&self, key: &str) -> Option<Entity> {
        self.check_and_expire(key);
        self.data.get(key)
    }

    pub fn mutate_entity<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entity>) -> R) -> R {
        self.check_and_expire(key);
        self.data.mutate(key, f)
    }

    pub fn put_entity(&self, key: impl Into<String>, value: Entity) {
        self.data.put(key, value);
    }

    pub fn put_if_exists(&self, key: &str, value: Entity) -> bool {
        self.data.put_if_exists(key, value)
    }

    pub fn put_if_absent(&self, key: impl Into<String>, value: Entity) -> bool {
        self.data.put_if_absent(key, value)
    }

    /// Remove a key's data, TTL, and any pending expiry callback.
    /// Returns `true` if data was present.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.data.remove(key);
        self.ttl.remove(key);
        self.time_wheel.cancel(&Self::expiry_job_key(key));
        removed
    }

    pub fn removes(&self, keys: &[String]) -> usize {
        keys.iter().filter(|k| self.remove(k)).count()
    }

    pub fn flush(&self) {
        self.data.clear();
        self.ttl.clear();
        self.version.clear();
    }

    pub fn len(&self) -> i64 {
        self.data.len()
    }

    /// Schedule (or reschedule) expiration of `key` at `at_millis`, via
    /// the time wheel, in addition to recording the TTL so lazy checks
    /// see it immediately. Named `set_ttl_and_schedule` rather than the
    /// original's bare `expire` since every command executor only holds
    /// a `&SingleDb`, not the `Arc` `expire`'s scheduled callback needs
    /// to re-enter the DB with.
    pub fn set_ttl_and_schedule(&self, key: &str, at_millis: i64) {
        self.ttl.put(key.to_string(), at_millis);
        let delay_secs = ((at_millis - now_millis()).max(0) as u64 + 999) / 1000;
        let weak = self.self_weak.clone();
        let owned_key = key.to_string();
        self.time_wheel.delay(
            delay_secs,
            Self::expiry_job_key(key),
            Box::new(move || {
                if let Some(db) = weak.upgrade() {
                    let _guard = db.locker.lock(&owned_key);
                    db.check_and_expire(&owned_key);
                }
            }),
        );
    }

    /// Returns `true` if the key had a TTL that was removed.
    pub fn persist(&self, key: &str) -> bool {
        let had = self.ttl.get(key).is_some();
        self.ttl.remove(key);
        self.time_wheel.cancel(&Self::expiry_job_key(key));
        had
    }

    pub fn ttl_millis(&self, key: &str) -> Option<i64> {
        self.ttl.get(key)
    }

    pub fn is_expired(&self, key: &str) -> bool {
        matches!(self.ttl.get(key), Some(exp) if now_millis() > exp)
    }

    pub fn get_version(&self, key: &str) -> u32 {
        self.version.get(key).unwrap_or(0)
    }

    fn bump_version(&self, key: &str) {
        let next = self.version.get(key).unwrap_or(0).wrapping_add(1);
        self.version.put(key.to_string(), next);
    }

    /// Bump every key's version, exposed for the transaction controller's
    /// EXEC step 6 (§4.6) — ordinary dispatch bumps through
    /// [`Self::exec_locked`] instead.
    pub(crate) fn bump_versions(&self, keys: &[String]) {
        for k in keys {
            self.bump_version(k);
        }
    }

    pub fn for_each(&self, f: impl FnMut(&str, &Entity) -> bool) {
        self.data.for_each(f);
    }

    pub fn rw_locks<'a>(&'a self, write_keys: &[String], read_keys: &[String]) -> MultiGuard<'a> {
        self.locker.rw_lock_all(write_keys, read_keys)
    }

    pub fn lock_key<'a>(&'a self, key: &str) -> MultiGuard<'a> {
        self.locker.lock_all(&[key.to_string()])
    }

    /// Top-level entry for one command on this DB (§4.4). Handles the
    /// four transaction-control verbs directly; everything else goes
    /// through the registry.
    pub fn exec(self: &Arc<Self>, conn: &ConnState, argv: CmdLine) -> Reply {
        if argv.is_empty() {
            return Reply::error(ServerError::Protocol("empty command line".to_string()));
        }
        let name = ascii_lowercase(&argv[0]);

        match name.as_str() {
            "multi" => return self.cmd_multi(conn),
            "discard" => return self.cmd_discard(conn),
            "watch" => return self.cmd_watch(conn, &argv),
            "exec" => return transaction::exec_multi(self, conn),
            _ => {}
        }

        let Some(spec) = self.registry.get(&name) else {
            conn.mark_dirty();
            return Reply::error(ServerError::UnknownCommand(name));
        };
        if !validate_arity(spec.arity, argv.len() as i64) {
            conn.mark_dirty();
            return Reply::error(ServerError::ArgNum(name));
        }
        if conn.multi_state() != MultiState::Normal {
            conn.queue_cmd(argv);
            return Reply::queued();
        }
        self.exec_locked(spec, &argv)
    }

    /// Run `spec` against `argv`, acquiring locks and appending to the
    /// AOF, but skipping the transaction/registry-lookup machinery
    /// `exec` does. Used by the normal dispatch path once a spec has
    /// already been resolved.
    fn exec_locked(&self, spec: &CommandSpec, argv: &CmdLine) -> Reply {
        let args = &argv[1..];
        let (write_keys, read_keys) = (spec.prepare)(args);
        for k in &write_keys {
            self.bump_version(k);
        }
        let reply = {
            let _guard = self.rw_locks(&write_keys, &read_keys);
            (spec.executor)(self, args)
        };
        metrics::counter!("kv_commands_executed_total", "command" => spec.name).increment(1);
        if !reply.is_error() && spec.flags.write {
            self.aof.append(self.index, argv.clone());
        }
        metrics::gauge!("kv_db_keys", "db" => self.index.to_string()).set(self.len() as f64);
        reply
    }

    /// Run a command's executor directly, without acquiring key-locks —
    /// the caller already holds them (transaction EXEC, undo replay, AOF
    /// replay).
    pub fn exec_with_lock(&self, argv: &CmdLine) -> Reply {
        if argv.is_empty() {
            return Reply::error(ServerError::Protocol("empty command line".to_string()));
        }
        let name = ascii_lowercase(&argv[0]);
        let Some(spec) = self.registry.get(&name) else {
            return Reply::error(ServerError::UnknownCommand(name));
        };
        (spec.executor)(self, &argv[1..])
    }

    /// Pre-image compensating commands for `argv`, captured before the
    /// mutation runs (§4.6, §4.10).
    pub fn undo_logs(&self, argv: &CmdLine) -> Vec<CmdLine> {
        if argv.is_empty() {
            return Vec::new();
        }
        let name = ascii_lowercase(&argv[0]);
        let Some(spec) = self.registry.get(&name) else {
            return Vec::new();
        };
        match spec.undo {
            Some(undo_fn) => undo_fn(self, &argv[1..]),
            None => Vec::new(),
        }
    }

    fn cmd_multi(&self, conn: &ConnState) -> Reply {
        if conn.multi_state() != MultiState::Normal {
            return Reply::error(ServerError::NestedMulti);
        }
        conn.start_multi();
        Reply::ok()
    }

    fn cmd_discard(&self, conn: &ConnState) -> Reply {
        if conn.multi_state() == MultiState::Normal {
            return Reply::error(ServerError::DiscardWithoutMulti);
        }
        conn.end_multi();
        Reply::ok()
    }

    fn cmd_watch(&self, conn: &ConnState, argv: &CmdLine) -> Reply {
        if argv.len() < 2 {
            return Reply::error(ServerError::ArgNum("watch".to_string()));
        }
        for key in &argv[1..] {
            let key = String::from_utf8_lossy(key).to_string();
            let version = self.get_version(&key);
            conn.watch(key, version);
        }
        Reply::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::sync::Arc;

    fn test_db() -> Arc<SingleDb> {
        SingleDb::new(0, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()))
    }

    #[test]
    fn remove_clears_data_and_ttl() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        db.set_ttl_and_schedule("k", now_millis() + 60_000);
        assert!(db.remove("k"));
        assert!(db.get_entity("k").is_none());
        assert_eq!(db.ttl_millis("k"), None);
    }

    #[test]
    fn lazy_expiration_on_get() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        db.set_ttl_and_schedule("k", now_millis() - 1);
        assert!(db.get_entity("k").is_none());
    }

    #[test]
    fn persist_removes_ttl_without_removing_data() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        db.set_ttl_and_schedule("k", now_millis() + 60_000);
        assert!(db.persist("k"));
        assert!(db.get_entity("k").is_some());
        assert_eq!(db.ttl_millis("k"), None);
    }

    #[test]
    fn version_bumps_on_write_commands() {
        let db = test_db();
        let conn = ConnState::new(Arc::new(|_: &Reply| {}));
        let v0 = db.get_version("k");
        db.exec(&conn, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")]);
        assert!(db.get_version("k") > v0);
    }

    #[test]
    fn unknown_command_marks_a_transaction_dirty() {
        let db = test_db();
        let conn = ConnState::new(Arc::new(|_: &Reply| {}));
        conn.start_multi();
        let reply = db.exec(&conn, vec![Bytes::from_static(b"NOSUCHCMD")]);
        assert!(reply.is_error());
        assert_eq!(conn.multi_state(), MultiState::MultiDirty);
    }
}
