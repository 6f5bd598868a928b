//! The multi-DB server (C5): `N` Single-DB engines behind one dispatch
//! entry point, ported from `original_source/database/multi_db.go`'s
//! command-routing order (§4.5).

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use kv_proto::{CmdLine, ConnectionSink, Reply, ServerError};
use parking_lot::RwLock;

use crate::commands::admin;
use crate::conn::{ConnRole, ConnState};
use crate::db::{AofSink, SingleDb};
use crate::pubsub::PubSubHub;
use crate::registry::Registry;

/// Master (the default) or slave, toggled by `SLAVEOF` (§4.9). The
/// actual handshake/streaming state machine lives in `kv-replication`;
/// this crate only needs to know which side of it to act as for the
/// read-only-slave guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationRole {
    Master,
    Slave,
}

/// The replication worker's control surface, as seen from the command
/// dispatcher. `kv-replication` provides the real implementation;
/// a server with replication disabled uses [`NoopReplicationControl`].
pub trait ReplicationControl: Send + Sync {
    fn role(&self) -> ReplicationRole;
    fn slaveof(&self, host: String, port: u16);
    fn slaveof_no_one(&self);
}

pub struct NoopReplicationControl {
    role: AtomicU8,
}

impl Default for NoopReplicationControl {
    fn default() -> Self {
        Self { role: AtomicU8::new(0) }
    }
}

impl ReplicationControl for NoopReplicationControl {
    fn role(&self) -> ReplicationRole {
        if self.role.load(Ordering::Relaxed) == 0 {
            ReplicationRole::Master
        } else {
            ReplicationRole::Slave
        }
    }

    fn slaveof(&self, _host: String, _port: u16) {
        self.role.store(1, Ordering::Relaxed);
    }

    fn slaveof_no_one(&self) {
        self.role.store(0, Ordering::Relaxed);
    }
}

/// `SAVE`/`BGSAVE`/`BGREWRITEAOF`'s control surface. `kv-persist`
/// provides the real implementation; [`NoopPersistenceHooks`] is used
/// when persistence is disabled (tests, or a config with AOF/RDB off).
pub trait PersistenceHooks: Send + Sync {
    fn save(&self) -> Result<(), String>;
    fn bgsave(&self);
    fn bgrewriteaof(&self);
}

pub struct NoopPersistenceHooks;

impl PersistenceHooks for NoopPersistenceHooks {
    fn save(&self) -> Result<(), String> {
        Ok(())
    }

    fn bgsave(&self) {}

    fn bgrewriteaof(&self) {}
}

fn ascii_lowercase(b: &Bytes) -> String {
    String::from_utf8_lossy(b).to_ascii_lowercase()
}

fn is_mutating_admin_verb(name: &str) -> bool {
    matches!(name, "flushdb" | "flushall" | "copy")
}

pub struct MultiDb {
    databases: Vec<RwLock<Arc<SingleDb>>>,
    registry: Arc<Registry>,
    aof: Arc<dyn AofSink>,
    time_wheel: Arc<kv_store::TimeWheel>,
    pubsub: PubSubHub,
    password: Option<String>,
    replication: RwLock<Arc<dyn ReplicationControl>>,
    persistence: RwLock<Arc<dyn PersistenceHooks>>,
}

impl MultiDb {
    pub fn new(
        num_databases: usize,
        registry: Arc<Registry>,
        aof: Arc<dyn AofSink>,
        time_wheel: Arc<kv_store::TimeWheel>,
        password: Option<String>,
    ) -> Arc<Self> {
        let databases = (0..num_databases.max(1))
            .map(|i| RwLock::new(SingleDb::new(i, registry.clone(), aof.clone(), time_wheel.clone())))
            .collect();
        Arc::new(Self {
            databases,
            registry,
            aof,
            time_wheel,
            pubsub: PubSubHub::new(),
            password,
            replication: RwLock::new(Arc::new(NoopReplicationControl::default())),
            persistence: RwLock::new(Arc::new(NoopPersistenceHooks)),
        })
    }

    /// Installs the replication control surface (§4.9). Takes `&self`
    /// rather than `Arc::get_mut`-ing a unique `Arc<Self>` because the
    /// control surface itself is typically built from a `Weak<Self>`
    /// handed back into this very `MultiDb` (§9 "Cyclic references") —
    /// by the time this is called a `Weak` to `self` already exists, so
    /// `Arc::get_mut` would never succeed.
    pub fn with_replication(self: Arc<Self>, control: Arc<dyn ReplicationControl>) -> Arc<Self> {
        *self.replication.write() = control;
        self
    }

    pub fn with_persistence(self: Arc<Self>, hooks: Arc<dyn PersistenceHooks>) -> Arc<Self> {
        *self.persistence.write() = hooks;
        self
    }

    pub fn num_databases(&self) -> usize {
        self.databases.len()
    }

    pub fn database(&self, index: usize) -> Option<Arc<SingleDb>> {
        self.databases.get(index).map(|slot| slot.read().clone())
    }

    pub fn pubsub(&self) -> &PubSubHub {
        &self.pubsub
    }

    pub fn replication_role(&self) -> ReplicationRole {
        self.replication.read().role()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn aof(&self) -> &Arc<dyn AofSink> {
        &self.aof
    }

    pub fn time_wheel(&self) -> &Arc<kv_store::TimeWheel> {
        &self.time_wheel
    }

    /// Replaces the DB at `index` with a fresh [`SingleDb`], keeping the
    /// same AOF/time-wheel wiring (§4.5).
    pub fn flush_db(&self, index: usize) {
        if let Some(slot) = self.databases.get(index) {
            *slot.write() = SingleDb::new(index, self.registry.clone(), self.aof.clone(), self.time_wheel.clone());
        }
    }

    /// Atomically swaps in an already-built [`SingleDb`] at `index` —
    /// the replication full-resync path (§4.9 handshake step 7) builds
    /// one from a decoded RDB payload with this `MultiDb`'s own
    /// registry/AOF/time-wheel wiring, then calls this to install it.
    /// Returns `false` if `index` is out of range.
    pub fn replace_db(&self, index: usize, db: Arc<SingleDb>) -> bool {
        match self.databases.get(index) {
            Some(slot) => {
                *slot.write() = db;
                true
            }
            None => false,
        }
    }

    /// Flushes every DB and appends one `FlushAll` AOF entry (§4.5).
    pub fn flush_all(&self) {
        for (i, slot) in self.databases.iter().enumerate() {
            *slot.write() = SingleDb::new(i, self.registry.clone(), self.aof.clone(), self.time_wheel.clone());
        }
        self.aof.append(0, vec![Bytes::from_static(b"FLUSHALL")]);
    }

    /// Top-level entry point for one client command (§4.5). Catches
    /// panics from lower layers at this boundary (§4.4's failure
    /// semantics) and converts them into a generic error reply.
    pub fn exec(self: &Arc<Self>, conn: &Arc<ConnState>, argv: CmdLine) -> Reply {
        let db = self.clone();
        let conn = conn.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| db.exec_inner(&conn, argv)));
        match result {
            Ok(reply) => reply,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                tracing::error!(panic = %message, backtrace = ?backtrace::Backtrace::new(), "command dispatch panicked");
                Reply::error(ServerError::Unknown)
            }
        }
    }

    fn exec_inner(self: &Arc<Self>, conn: &Arc<ConnState>, argv: CmdLine) -> Reply {
        if argv.is_empty() {
            return Reply::error(ServerError::Protocol("empty command line".to_string()));
        }
        let name = ascii_lowercase(&argv[0]);

        if name == "auth" {
            return self.cmd_auth(conn, &argv);
        }
        if self.password.is_some() && !conn.is_authenticated() {
            return Reply::error(ServerError::NoAuth);
        }
        if name == "slaveof" {
            return self.cmd_slaveof(&argv);
        }
        let is_write = if let Some(spec) = self.registry.get(&name) {
            spec.flags.write
        } else {
            is_mutating_admin_verb(&name)
        };
        if self.replication.read().role() == ReplicationRole::Slave && conn.role() == ConnRole::Normal && is_write {
            return Reply::error(ServerError::ReadOnlySlave);
        }

        match name.as_str() {
            "ping" => return Reply::pong(),
            "subscribe" => return self.cmd_subscribe(conn, &argv),
            "unsubscribe" => return self.cmd_unsubscribe(conn, &argv),
            "publish" => return self.cmd_publish(&argv),
            "select" => return self.cmd_select(conn, &argv),
            "flushdb" => return self.cmd_flushdb(conn),
            "flushall" => return self.cmd_flushall(),
            "copy" => return self.cmd_copy(conn, &argv),
            "save" => return self.cmd_save(),
            "bgsave" => return self.cmd_bgsave(),
            "bgrewriteaof" => return self.cmd_bgrewriteaof(),
            _ => {}
        }

        match self.database(conn.db_index()) {
            Some(target) => target.exec(conn, argv),
            None => Reply::error(ServerError::Other("ERR DB index is out of range".to_string())),
        }
    }

    fn cmd_auth(&self, conn: &ConnState, argv: &CmdLine) -> Reply {
        let Some(expected) = &self.password else {
            return Reply::error(ServerError::Other("ERR Client sent AUTH, but no password is set".to_string()));
        };
        let Some(given) = argv.get(1) else {
            return Reply::error(ServerError::ArgNum("auth".to_string()));
        };
        if given.as_ref() == expected.as_bytes() {
            conn.set_authenticated(true);
            Reply::ok()
        } else {
            Reply::error(ServerError::InvalidPassword)
        }
    }

    fn cmd_slaveof(&self, argv: &CmdLine) -> Reply {
        if argv.len() != 3 {
            return Reply::error(ServerError::ArgNum("slaveof".to_string()));
        }
        let host = String::from_utf8_lossy(&argv[1]).to_string();
        let port_arg = String::from_utf8_lossy(&argv[2]).to_string();
        if host.eq_ignore_ascii_case("no") && port_arg.eq_ignore_ascii_case("one") {
            self.replication.read().slaveof_no_one();
            return Reply::ok();
        }
        let Ok(port) = port_arg.parse::<u16>() else {
            return Reply::error(ServerError::Syntax);
        };
        self.replication.read().slaveof(host, port);
        Reply::ok()
    }

    fn cmd_subscribe(&self, conn: &Arc<ConnState>, argv: &CmdLine) -> Reply {
        if argv.len() < 2 {
            return Reply::error(ServerError::ArgNum("subscribe".to_string()));
        }
        let sink: Arc<dyn ConnectionSink + Send + Sync> = conn.clone();
        for channel in &argv[1..] {
            let channel = String::from_utf8_lossy(channel).to_string();
            conn.subscribe(&channel);
            self.pubsub.subscribe(&channel, sink.clone());
            let reply = Reply::array(vec![
                Reply::bulk(b"subscribe".to_vec()),
                Reply::bulk(channel.into_bytes()),
                Reply::integer(conn.subscription_count() as i64),
            ]);
            conn.push(&reply);
        }
        Reply::NoReply
    }

    fn cmd_unsubscribe(&self, conn: &Arc<ConnState>, argv: &CmdLine) -> Reply {
        let channels: Vec<String> = if argv.len() > 1 {
            argv[1..].iter().map(|c| String::from_utf8_lossy(c).to_string()).collect()
        } else {
            conn.subscriptions()
        };
        if channels.is_empty() {
            let reply = Reply::array(vec![Reply::bulk(b"unsubscribe".to_vec()), Reply::null_bulk(), Reply::integer(0)]);
            conn.push(&reply);
            return Reply::NoReply;
        }
        for channel in channels {
            conn.unsubscribe(&channel);
            self.pubsub.unsubscribe(&channel, conn.conn_id());
            let reply = Reply::array(vec![
                Reply::bulk(b"unsubscribe".to_vec()),
                Reply::bulk(channel.into_bytes()),
                Reply::integer(conn.subscription_count() as i64),
            ]);
            conn.push(&reply);
        }
        Reply::NoReply
    }

    fn cmd_publish(&self, argv: &CmdLine) -> Reply {
        if argv.len() != 3 {
            return Reply::error(ServerError::ArgNum("publish".to_string()));
        }
        let channel = String::from_utf8_lossy(&argv[1]).to_string();
        let count = self.pubsub.publish(&channel, &argv[2]);
        Reply::integer(count as i64)
    }

    fn cmd_select(&self, conn: &ConnState, argv: &CmdLine) -> Reply {
        let Some(raw) = argv.get(1) else {
            return Reply::error(ServerError::ArgNum("select".to_string()));
        };
        let Ok(index) = String::from_utf8_lossy(raw).parse::<usize>() else {
            return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
        };
        if index >= self.databases.len() {
            return Reply::error(ServerError::Other("ERR DB index is out of range".to_string()));
        }
        conn.select_db(index);
        Reply::ok()
    }

    fn cmd_flushdb(&self, conn: &ConnState) -> Reply {
        if let Some(db) = self.databases.get(conn.db_index()) {
            db.flush();
        }
        Reply::ok()
    }

    fn cmd_flushall(&self) -> Reply {
        for db in &self.databases {
            db.flush();
        }
        self.aof.append(0, vec![Bytes::from_static(b"FLUSHALL")]);
        Reply::ok()
    }

    fn cmd_copy(&self, conn: &ConnState, argv: &CmdLine) -> Reply {
        if argv.len() < 3 {
            return Reply::error(ServerError::ArgNum("copy".to_string()));
        }
        let src_key = String::from_utf8_lossy(&argv[1]).to_string();
        let dst_key = String::from_utf8_lossy(&argv[2]).to_string();
        let mut dst_index = conn.db_index();
        let mut replace = false;
        let mut i = 3;
        while i < argv.len() {
            let flag = String::from_utf8_lossy(&argv[i]).to_ascii_lowercase();
            match flag.as_str() {
                "replace" => {
                    replace = true;
                    i += 1;
                }
                "db" => {
                    let Some(raw) = argv.get(i + 1) else {
                        return Reply::error(ServerError::Syntax);
                    };
                    let Ok(parsed) = String::from_utf8_lossy(raw).parse::<usize>() else {
                        return Reply::error(ServerError::Syntax);
                    };
                    dst_index = parsed;
                    i += 2;
                }
                _ => return Reply::error(ServerError::Syntax),
            }
        }
        let Some(src_db) = self.databases.get(conn.db_index()) else {
            return Reply::error(ServerError::Other("ERR DB index is out of range".to_string()));
        };
        let Some(dst_db) = self.databases.get(dst_index) else {
            return Reply::error(ServerError::Other("ERR DB index is out of range".to_string()));
        };
        let copied = admin::copy(src_db, dst_db, &src_key, &dst_key, replace);
        if copied {
            self.aof.append(dst_index, vec![Bytes::from_static(b"COPY"), argv[1].clone(), argv[2].clone()]);
        }
        Reply::integer(if copied { 1 } else { 0 })
    }

    fn cmd_save(&self) -> Reply {
        match self.persistence.read().save() {
            Ok(()) => Reply::ok(),
            Err(msg) => Reply::error(ServerError::Other(format!("ERR {msg}"))),
        }
    }

    fn cmd_bgsave(&self) -> Reply {
        self.persistence.read().bgsave();
        Reply::Simple("Background saving started".to_string())
    }

    fn cmd_bgrewriteaof(&self) -> Reply {
        self.persistence.read().bgrewriteaof();
        Reply::Simple("Background append only file rewriting started".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NoopAofSink;
    use crate::registry::Registry;
    use kv_store::TimeWheel;
    use kv_types::Entity;

    fn test_server() -> Arc<MultiDb> {
        MultiDb::new(4, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()), None)
    }

    fn dummy_conn() -> Arc<ConnState> {
        Arc::new(ConnState::new(Arc::new(|_: &Reply| {})))
    }

    #[test]
    fn select_switches_active_db() {
        let server = test_server();
        let conn = dummy_conn();
        assert_eq!(server.exec(&conn, vec![Bytes::from_static(b"SELECT"), Bytes::from_static(b"2")]), Reply::ok());
        assert_eq!(conn.db_index(), 2);
    }

    #[test]
    fn select_out_of_range_is_an_error() {
        let server = test_server();
        let conn = dummy_conn();
        assert!(server.exec(&conn, vec![Bytes::from_static(b"SELECT"), Bytes::from_static(b"99")]).is_error());
    }

    #[test]
    fn unauthenticated_client_is_rejected_when_a_password_is_set() {
        let server = MultiDb::new(1, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()), Some("secret".to_string()));
        let conn = dummy_conn();
        assert_eq!(server.exec(&conn, vec![Bytes::from_static(b"PING")]), Reply::error(ServerError::NoAuth));
        assert_eq!(server.exec(&conn, vec![Bytes::from_static(b"AUTH"), Bytes::from_static(b"secret")]), Reply::ok());
        assert_eq!(server.exec(&conn, vec![Bytes::from_static(b"PING")]), Reply::pong());
    }

    #[test]
    fn copy_crosses_into_the_target_db() {
        let server = test_server();
        let conn = dummy_conn();
        server.database(0).unwrap().put_entity("k", Entity::Str(b"v".to_vec()));
        let reply = server.exec(&conn, vec![Bytes::from_static(b"COPY"), Bytes::from_static(b"k"), Bytes::from_static(b"k2"), Bytes::from_static(b"DB"), Bytes::from_static(b"1")]);
        assert_eq!(reply, Reply::integer(1));
        assert!(server.database(1).unwrap().get_entity("k2").is_some());
    }

    #[test]
    fn publish_with_no_subscribers_returns_zero() {
        let server = test_server();
        let conn = dummy_conn();
        assert_eq!(server.exec(&conn, vec![Bytes::from_static(b"PUBLISH"), Bytes::from_static(b"ch"), Bytes::from_static(b"hi")]), Reply::integer(0));
    }

    #[test]
    fn a_panicking_executor_is_caught_and_reported() {
        let server = test_server();
        let conn = dummy_conn();
        let reply = server.exec(&conn, vec![Bytes::from_static(b"LPOS")]);
        assert!(reply.is_error());
    }
}
