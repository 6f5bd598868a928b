//! The slave-side replication state machine (§4.9), ported from
//! `original_source/database/replication.go`'s `syncWithMaster`/
//! `connectWithMaster` handshake, with the `modCount`+mutex bookkeeping
//! that protected in-flight workers from a config change mid-sync
//! replaced by a [`CancellationToken`] per §9 "Coroutine control flow in
//! replication": every `SLAVEOF` cancels the previous worker's token and
//! spawns a fresh one, so there is never more than one live worker
//! touching the connection.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use kv_engine::multi_db::{ReplicationControl, ReplicationRole};
use kv_engine::{ConnRole, ConnState, MultiDb, SingleDb};
use kv_proto::resp::{encode_inline, Decoder, Frame};
use kv_proto::Reply;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Everything about this server that the handshake needs to announce to
/// a master, plus the streaming-side timeout (§4.12's `masterauth`,
/// `slave-announce-port`, `slave-announce-ip`, `repl-timeout`).
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub masterauth: Option<String>,
    pub announce_port: u16,
    pub announce_ip: Option<String>,
    pub repl_timeout: Duration,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self { masterauth: None, announce_port: 0, announce_ip: None, repl_timeout: Duration::from_secs(60) }
    }
}

struct Inner {
    worker: Option<CancellationToken>,
}

/// Concrete [`ReplicationControl`] that drives the slave-side state
/// machine. Holds only a [`Weak`] reference back to the [`MultiDb`] it
/// serves, mirroring [`kv_engine::SingleDb`]'s own `self_weak` pattern —
/// the `MultiDb` owns this struct through an `Arc<dyn ReplicationControl>`,
/// so a strong back-reference would be a cycle.
pub struct SlaveReplication {
    multidb: Weak<MultiDb>,
    config: SlaveConfig,
    role: AtomicU8,
    state: Mutex<Inner>,
    self_weak: Weak<SlaveReplication>,
}

const ROLE_MASTER: u8 = 0;
const ROLE_SLAVE: u8 = 1;

impl SlaveReplication {
    pub fn new(multidb: Weak<MultiDb>, config: SlaveConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            multidb,
            config,
            role: AtomicU8::new(ROLE_MASTER),
            state: Mutex::new(Inner { worker: None }),
            self_weak: weak.clone(),
        })
    }
}

impl ReplicationControl for SlaveReplication {
    fn role(&self) -> ReplicationRole {
        if self.role.load(Ordering::Relaxed) == ROLE_SLAVE {
            ReplicationRole::Slave
        } else {
            ReplicationRole::Master
        }
    }

    fn slaveof(&self, host: String, port: u16) {
        self.role.store(ROLE_SLAVE, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock();
            if let Some(old) = state.worker.take() {
                old.cancel();
            }
            state.worker = Some(token.clone());
        }
        let Some(this) = self.self_weak.upgrade() else { return };
        tokio::spawn(async move {
            this.run(host, port, token).await;
        });
    }

    fn slaveof_no_one(&self) {
        self.role.store(ROLE_MASTER, Ordering::Relaxed);
        let mut state = self.state.lock();
        if let Some(old) = state.worker.take() {
            old.cancel();
        }
    }
}

impl SlaveReplication {
    /// Owns one generation of the handshake/streaming/reconnect cycle
    /// until cancelled. Structured concurrency per §9: this task owns
    /// the socket for its whole lifetime and never outlives `cancel`.
    async fn run(self: Arc<Self>, host: String, port: u16, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(multidb) = self.multidb.upgrade() else { return };

            let handshake = tokio::select! {
                _ = cancel.cancelled() => return,
                r = handshake(&host, port, &self.config, &multidb) => r,
            };
            let (stream, decoder) = match handshake {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(%host, port, error = %e, "replication handshake failed, reverting to master role");
                    self.slaveof_no_one();
                    return;
                }
            };

            tracing::info!(%host, port, "replication full resync complete, entering streaming");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                r = stream_loop(multidb, stream, decoder, self.config.repl_timeout) => r,
            };
            if let Err(e) = outcome {
                tracing::warn!(%host, port, error = %e, "replication stream ended, reconnecting");
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }
}

fn protocol_err(e: kv_proto::ServerError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn bad(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn read_one_frame(stream: &mut TcpStream, decoder: &mut Decoder) -> io::Result<Frame> {
    loop {
        if let Some(frame) = decoder.next_frame().map_err(protocol_err)? {
            return Ok(frame);
        }
        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "master closed the connection during handshake"));
        }
        decoder.feed(&buf[..n]);
    }
}

async fn send_and_expect_ok(stream: &mut TcpStream, decoder: &mut Decoder, args: &[&str]) -> io::Result<()> {
    stream.write_all(&encode_inline(args)).await?;
    match read_one_frame(stream, decoder).await? {
        f if f.is_ok_status() => Ok(()),
        other => Err(bad(format!("expected +OK in response to {args:?}, got {other:?}"))),
    }
}

/// Steps 1-8 of the handshake (§4.9): dial, `PING`, optional `AUTH`,
/// `REPLCONF` announcements, `PSYNC`, decode the RDB bulk, and swap the
/// decoded keyspace into every database of `multidb` before returning
/// the still-open socket and decoder for the caller's streaming loop.
async fn handshake(host: &str, port: u16, config: &SlaveConfig, multidb: &Arc<MultiDb>) -> io::Result<(TcpStream, Decoder)> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let mut decoder = Decoder::new();

    stream.write_all(&encode_inline(&["PING"])).await?;
    match read_one_frame(&mut stream, &mut decoder).await? {
        Frame::Error(msg) => {
            let allowed = msg.starts_with("NOAUTH") || msg.starts_with("NOPERM") || msg.starts_with("ERR operation not permitted");
            if !allowed {
                return Err(bad(format!("unexpected error reply to PING from master: {msg}")));
            }
        }
        _ => {}
    }

    if let Some(password) = &config.masterauth {
        send_and_expect_ok(&mut stream, &mut decoder, &["AUTH", password]).await?;
    }

    let announce_port = if config.announce_port != 0 { config.announce_port } else { port };
    send_and_expect_ok(&mut stream, &mut decoder, &["REPLCONF", "listening-port", &announce_port.to_string()]).await?;
    if let Some(ip) = &config.announce_ip {
        send_and_expect_ok(&mut stream, &mut decoder, &["REPLCONF", "ip-address", ip]).await?;
    }
    send_and_expect_ok(&mut stream, &mut decoder, &["REPLCONF", "capa", "psync2"]).await?;

    stream.write_all(&encode_inline(&["PSYNC", "?", "-1"])).await?;
    match read_one_frame(&mut stream, &mut decoder).await? {
        Frame::Simple(s) if s.starts_with("FULLRESYNC") => {
            tracing::info!(status = %s, "received FULLRESYNC from master");
        }
        other => return Err(bad(format!("expected FULLRESYNC status line, got {other:?}"))),
    }

    let rdb_bytes = match read_one_frame(&mut stream, &mut decoder).await? {
        Frame::Bulk(Some(bytes)) => bytes,
        other => return Err(bad(format!("expected RDB bulk payload, got {other:?}"))),
    };
    apply_full_resync(multidb, &rdb_bytes)?;

    Ok((stream, decoder))
}

/// Decode an RDB snapshot and atomically swap each database it covers
/// into `multidb`, keeping the live registry/AOF/time-wheel wiring
/// (§4.9 step 7, "preserving AOF wiring"). A database absent from the
/// snapshot (the master had no keys in it) is reset to empty.
fn apply_full_resync(multidb: &Arc<MultiDb>, rdb_bytes: &[u8]) -> io::Result<()> {
    let loaded = kv_persist::load_rdb_bytes(rdb_bytes)?;
    let mut by_index = std::collections::HashMap::new();
    for db in loaded {
        by_index.insert(db.index, db.keys);
    }

    for index in 0..multidb.num_databases() {
        let fresh = SingleDb::new(index, multidb.registry().clone(), multidb.aof().clone(), multidb.time_wheel().clone());
        if let Some(keys) = by_index.remove(&index) {
            for key in keys {
                fresh.put_entity(key.key.clone(), key.entity);
                if let Some(at) = key.expire_at_millis {
                    fresh.set_ttl_and_schedule(&key.key, at);
                }
            }
        }
        multidb.replace_db(index, fresh);
    }
    Ok(())
}

/// Streaming (§4.9): re-execute every inbound multi-bulk under a
/// synthetic [`ConnRole::ReplicationReceiver`] connection, exempting it
/// from the read-only-slave guard, and `REPLCONF ACK` once a second.
/// Returns `Ok(())` on a clean disconnect or a `repl_timeout` lapse —
/// either way the caller reconnects; an `Err` means a protocol violation.
async fn stream_loop(multidb: Arc<MultiDb>, mut stream: TcpStream, mut decoder: Decoder, repl_timeout: Duration) -> io::Result<()> {
    let conn = Arc::new(ConnState::new(Arc::new(|_: &Reply| {})));
    conn.set_role(ConnRole::ReplicationReceiver);
    conn.set_authenticated(true);

    let mut last_recv = Instant::now();
    let mut ack_ticker = tokio::time::interval(Duration::from_secs(1));
    let mut offset: u64 = 0;
    let mut buf = [0u8; 16384];

    loop {
        tokio::select! {
            _ = ack_ticker.tick() => {
                let ack = encode_inline(&["REPLCONF", "ACK", &offset.to_string()]);
                if stream.write_all(&ack).await.is_err() {
                    return Ok(());
                }
                if last_recv.elapsed() > repl_timeout {
                    tracing::warn!(?repl_timeout, "no bytes from master within repl-timeout");
                    return Ok(());
                }
            }
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                decoder.feed(&buf[..n]);
                offset += n as u64;
                metrics::gauge!("kv_replication_offset").set(offset as f64);
                last_recv = Instant::now();
                loop {
                    match decoder.next_frame().map_err(protocol_err)? {
                        Some(frame) => match frame.into_cmd_line() {
                            Ok(cmd_line) => {
                                let _: Reply = multidb.exec(&conn, cmd_line);
                            }
                            Err(e) => tracing::warn!(error = %e, "malformed command streamed from master"),
                        },
                        None => break,
                    }
                }
                decoder.compact();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_engine::db::NoopAofSink;
    use kv_engine::registry::Registry;
    use kv_store::TimeWheel;
    use kv_types::Entity;

    fn test_multidb(n: usize) -> Arc<MultiDb> {
        MultiDb::new(n, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()), None)
    }

    #[test]
    fn role_tracks_slaveof_and_slaveof_no_one_without_spawning_when_unreferenced() {
        let multidb = test_multidb(1);
        let control = SlaveReplication::new(Arc::downgrade(&multidb), SlaveConfig::default());
        assert_eq!(control.role(), ReplicationRole::Master);
        control.role.store(ROLE_SLAVE, Ordering::Relaxed);
        assert_eq!(control.role(), ReplicationRole::Slave);
        control.slaveof_no_one();
        assert_eq!(control.role(), ReplicationRole::Master);
    }

    #[test]
    fn apply_full_resync_populates_and_resets_databases() {
        let multidb = test_multidb(2);
        multidb.database(0).unwrap().put_entity("stale", Entity::Str(b"x".to_vec()));

        let snapshot_source = test_multidb(2);
        snapshot_source.database(1).unwrap().put_entity("fresh", Entity::Str(b"v".to_vec()));
        let bytes = kv_persist::save_rdb_bytes(&snapshot_source);

        apply_full_resync(&multidb, &bytes).unwrap();

        assert!(multidb.database(0).unwrap().get_entity("stale").is_none());
        assert!(multidb.database(1).unwrap().get_entity("fresh").is_some());
    }
}
