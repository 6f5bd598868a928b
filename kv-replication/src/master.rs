//! The master side of replication (§4.9, "in scope only at the contract
//! level"): accept `REPLCONF`, answer `PSYNC` with a `FULLRESYNC` status
//! line followed by an RDB bulk, and mirror every mutating command to
//! every attached replica afterward.
//!
//! A replica connection is treated exactly like a pub/sub subscriber
//! (`kv_engine::pubsub::PubSubHub`): once attached, it receives
//! unsolicited [`kv_proto::Reply`] pushes through its existing
//! [`ConnectionSink`], so `kv-server`'s per-connection writer needs no
//! special case for replication traffic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kv_engine::{AofSink, ConnState, MultiDb};
use kv_proto::{CmdLine, ConnectionSink, Reply};
use rand::Rng;

const NO_DB_SELECTED: usize = usize::MAX;

fn random_replid() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 20];
    rng.fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct ReplicaHandle {
    sink: Arc<dyn ConnectionSink + Send + Sync>,
    last_db: AtomicUsize,
}

/// Registry of attached replica connections, doubling as the
/// [`AofSink`] that mirrors every committed write to all of them. Wired
/// into a server's `MultiDb` (alone, or fanned out alongside the real
/// AOF writer via [`kv_persist::FanOutAofSink`]) regardless of whether
/// any replica is currently attached — `append` is a no-op over an
/// empty registry.
#[derive(Default)]
pub struct MasterReplicas {
    replicas: DashMap<u64, ReplicaHandle>,
}

impl MasterReplicas {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, sink: Arc<dyn ConnectionSink + Send + Sync>) {
        let id = sink.conn_id();
        self.replicas.insert(id, ReplicaHandle { sink, last_db: AtomicUsize::new(NO_DB_SELECTED) });
        tracing::info!(conn_id = id, "replica attached");
    }

    pub fn detach(&self, conn_id: u64) {
        if self.replicas.remove(&conn_id).is_some() {
            tracing::info!(conn_id, "replica detached");
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

impl AofSink for MasterReplicas {
    fn append(&self, db_index: usize, cmd: CmdLine) {
        if self.replicas.is_empty() {
            return;
        }
        let cmd_reply = Reply::array(cmd.iter().map(|arg| Reply::bulk(arg.to_vec())).collect());
        for entry in self.replicas.iter() {
            let handle = entry.value();
            if handle.last_db.swap(db_index, Ordering::Relaxed) != db_index {
                let select = Reply::array(vec![Reply::bulk(b"SELECT".to_vec()), Reply::bulk(db_index.to_string().into_bytes())]);
                handle.sink.push(&select);
            }
            handle.sink.push(&cmd_reply);
        }
    }
}

/// Master-side `REPLCONF` handling: acknowledge the listening-port/
/// ip-address/capa announcements a connecting slave sends during the
/// handshake, and silently swallow the `ACK <offset>` it sends every
/// second thereafter (§4.9 streaming).
pub fn handle_replconf(argv: &CmdLine) -> Reply {
    let Some(sub) = argv.get(1) else {
        return Reply::error(kv_proto::ServerError::ArgNum("replconf".to_string()));
    };
    match String::from_utf8_lossy(sub).to_ascii_lowercase().as_str() {
        "ack" | "getack" => Reply::NoReply,
        "listening-port" | "ip-address" | "capa" => Reply::ok(),
        _ => Reply::error(kv_proto::ServerError::Syntax),
    }
}

/// Master-side `PSYNC`: generate a fresh replication id, push the
/// `FULLRESYNC <replid> <offset>` status line and the RDB snapshot as a
/// bulk payload directly to `conn`, then attach it to `replicas` so it
/// starts receiving mirrored writes (§4.9 "Master side"). Always returns
/// [`Reply::NoReply`] — the handshake's replies are pushed directly
/// rather than returned as this call's single reply, matching how
/// `SUBSCRIBE` already pushes its confirmations (`kv_engine::MultiDb::cmd_subscribe`).
pub fn handle_psync(multidb: &MultiDb, replicas: &MasterReplicas, conn: &Arc<ConnState>) -> Reply {
    let replid = random_replid();
    let status = Reply::Simple(format!("FULLRESYNC {replid} 0"));
    conn.push(&status);

    let rdb_bytes = kv_persist::save_rdb_bytes(multidb);
    conn.push(&Reply::bulk(rdb_bytes));

    let sink: Arc<dyn ConnectionSink + Send + Sync> = conn.clone();
    replicas.attach(sink);
    Reply::NoReply
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kv_engine::db::NoopAofSink;
    use kv_engine::registry::Registry;
    use kv_store::TimeWheel;
    use kv_types::Entity;
    use std::sync::Mutex;

    struct RecordingSink {
        id: u64,
        received: Mutex<Vec<Reply>>,
    }

    impl ConnectionSink for RecordingSink {
        fn conn_id(&self) -> u64 {
            self.id
        }

        fn push(&self, reply: &Reply) {
            self.received.lock().unwrap().push(reply.clone());
        }
    }

    fn test_multidb() -> Arc<MultiDb> {
        MultiDb::new(2, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()), None)
    }

    #[test]
    fn replconf_acknowledges_announcements_and_swallows_ack() {
        assert!(handle_replconf(&vec![Bytes::from_static(b"REPLCONF"), Bytes::from_static(b"listening-port"), Bytes::from_static(b"6390")]).is_ok());
        assert_eq!(handle_replconf(&vec![Bytes::from_static(b"REPLCONF"), Bytes::from_static(b"ack"), Bytes::from_static(b"0")]), Reply::NoReply);
    }

    #[test]
    fn append_mirrors_to_every_attached_replica_with_a_leading_select() {
        let replicas = MasterReplicas::new();
        let received_a = Arc::new(RecordingSink { id: 1, received: Mutex::new(Vec::new()) });
        let received_b = Arc::new(RecordingSink { id: 2, received: Mutex::new(Vec::new()) });
        replicas.attach(received_a.clone());
        replicas.attach(received_b.clone());

        replicas.append(0, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"v")]);

        for sink in [&received_a, &received_b] {
            let events = sink.received.lock().unwrap();
            assert_eq!(events.len(), 2, "expected a leading SELECT plus the mirrored command");
        }
    }

    #[test]
    fn a_second_write_to_the_same_db_does_not_repeat_select() {
        let replicas = MasterReplicas::new();
        let sink = Arc::new(RecordingSink { id: 1, received: Mutex::new(Vec::new()) });
        replicas.attach(sink.clone());

        replicas.append(0, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"a"), Bytes::from_static(b"1")]);
        replicas.append(0, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"b"), Bytes::from_static(b"2")]);

        assert_eq!(sink.received.lock().unwrap().len(), 3);
    }

    #[test]
    fn detach_stops_further_mirroring() {
        let replicas = MasterReplicas::new();
        let sink = Arc::new(RecordingSink { id: 1, received: Mutex::new(Vec::new()) });
        replicas.attach(sink.clone());
        replicas.detach(1);
        replicas.append(0, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"a"), Bytes::from_static(b"1")]);
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[test]
    fn psync_pushes_a_fullresync_status_and_rdb_bulk_then_attaches() {
        let server = test_multidb();
        server.database(0).unwrap().put_entity("k", Entity::Str(b"v".to_vec()));
        let replicas = MasterReplicas::new();
        let sink = Arc::new(RecordingSink { id: 9, received: Mutex::new(Vec::new()) });
        let conn = Arc::new(ConnState::new(Arc::new({
            let sink = sink.clone();
            move |r: &Reply| sink.push(r)
        })));

        let reply = handle_psync(&server, &replicas, &conn);
        assert_eq!(reply, Reply::NoReply);
        let events = sink.received.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Reply::Simple(s) if s.starts_with("FULLRESYNC ")));
        assert!(matches!(&events[1], Reply::Bulk(Some(_))));
        assert_eq!(replicas.replica_count(), 1);
    }
}
