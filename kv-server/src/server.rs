//! The minimal Tokio accept loop (C16, SPEC_FULL.md §4.14): one task per
//! connection, using `kv-proto`'s internal RESP decoder to frame inbound
//! bytes and drive [`MultiDb::exec`]. Deliberately the simplest thing
//! that could work — no pipelining optimizations, no TLS — those belong
//! to the out-of-scope `Connection Layer` (§1).

use std::sync::Arc;

use kv_engine::{ConnState, MultiDb};
use kv_proto::resp::Decoder;
use kv_proto::{CmdLine, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::replication_bridge::ReplicationBridge;

/// Accept connections on `addr` until the process is killed. Each
/// connection gets its own reader task (decode + dispatch) and the reply
/// channel is drained inline by the same task between reads — out-of-band
/// pushes (a pub/sub message, a replica mirror) arrive on the same
/// channel from other tasks via [`ConnectionSink::push`].
pub async fn run(addr: &str, multidb: Arc<MultiDb>, bridge: Arc<ReplicationBridge>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening for connections");
    loop {
        let (stream, peer) = listener.accept().await?;
        let multidb = multidb.clone();
        let bridge = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, multidb, bridge).await {
                tracing::debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

/// Decrements the active-connections gauge when the connection task ends,
/// on any exit path (clean close, read error, or an early `return`).
struct ActiveConnGuard;

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("kv_connections_active").decrement(1.0);
    }
}

async fn handle_connection(stream: TcpStream, multidb: Arc<MultiDb>, bridge: Arc<ReplicationBridge>) -> anyhow::Result<()> {
    metrics::gauge!("kv_connections_active").increment(1.0);
    let _guard = ActiveConnGuard;
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Reply>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            if matches!(reply, Reply::NoReply) {
                continue;
            }
            if write_half.write_all(&reply.to_bytes()).await.is_err() {
                break;
            }
        }
    });

    let sink_tx = tx.clone();
    let conn = Arc::new(ConnState::new(Arc::new(move |reply: &Reply| {
        let _ = sink_tx.send(reply.clone());
    })));

    let mut decoder = Decoder::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder.feed(&buf[..n]);
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Reply::error(kv_proto::ServerError::Protocol(e.to_string())));
                    return Ok(());
                }
            };
            let cmd_line: CmdLine = match frame.into_cmd_line() {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Reply::error(e));
                    continue;
                }
            };
            decoder.compact();
            if cmd_line.is_empty() {
                continue;
            }
            let reply = dispatch(&multidb, &bridge, &conn, cmd_line);
            if tx.send(reply).is_err() {
                return Ok(());
            }
        }
    }
    drop(tx);
    let _ = writer.await;
    Ok(())
}

/// `PSYNC`/`REPLCONF` are handled by `kv-replication`'s master side
/// rather than the command registry (they push their replies directly
/// onto `conn` — see `kv_replication::master`), so they are special-cased
/// ahead of `MultiDb::exec` the same way `MultiDb::exec_inner` special-cases
/// `auth`/`slaveof`.
fn dispatch(multidb: &Arc<MultiDb>, bridge: &ReplicationBridge, conn: &Arc<ConnState>, cmd_line: CmdLine) -> Reply {
    let name = String::from_utf8_lossy(&cmd_line[0]).to_ascii_lowercase();
    match name.as_str() {
        "replconf" => kv_replication::handle_replconf(&cmd_line),
        "psync" => kv_replication::handle_psync(multidb, bridge.replicas(), conn),
        _ => multidb.exec(conn, cmd_line),
    }
}
