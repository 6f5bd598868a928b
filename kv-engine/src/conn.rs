//! Per-client connection state (C13): selected DB, auth state, the
//! transaction controller's queue/watch set, pub/sub subscriptions, and
//! a role tag distinguishing an ordinary client from the synthetic
//! connection a slave uses to re-execute commands streamed from its
//! master.
//!
//! `ConnState` has no idea what transport backs it; delivery of
//! out-of-band replies (a pub/sub message, a replication ACK prompt)
//! goes through a boxed sink supplied at construction, so this crate
//! never has to depend on the network layer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kv_proto::{CmdLine, ConnectionSink, Reply};
use parking_lot::Mutex;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction-controller state (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiState {
    Normal,
    Multi,
    MultiDirty,
}

/// Whether this connection is an ordinary client or the slave's
/// synthetic replication-receiving connection, exempt from the
/// read-only-slave guard (§4.9, GLOSSARY "Replication-receiver").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Normal,
    ReplicationReceiver,
}

struct Inner {
    db_index: usize,
    authenticated: bool,
    multi_state: MultiState,
    queued: Vec<CmdLine>,
    watching: HashMap<String, u32>,
    subscriptions: HashSet<String>,
    role: ConnRole,
}

pub struct ConnState {
    id: u64,
    sink: Arc<dyn Fn(&Reply) + Send + Sync>,
    inner: Mutex<Inner>,
}

impl ConnState {
    pub fn new(sink: Arc<dyn Fn(&Reply) + Send + Sync>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sink,
            inner: Mutex::new(Inner {
                db_index: 0,
                authenticated: false,
                multi_state: MultiState::Normal,
                queued: Vec::new(),
                watching: HashMap::new(),
                subscriptions: HashSet::new(),
                role: ConnRole::Normal,
            }),
        }
    }

    pub fn db_index(&self) -> usize {
        self.inner.lock().db_index
    }

    pub fn select_db(&self, index: usize) {
        self.inner.lock().db_index = index;
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    pub fn set_authenticated(&self, value: bool) {
        self.inner.lock().authenticated = value;
    }

    pub fn multi_state(&self) -> MultiState {
        self.inner.lock().multi_state
    }

    pub fn start_multi(&self) {
        let mut inner = self.inner.lock();
        inner.multi_state = MultiState::Multi;
        inner.queued.clear();
    }

    pub fn mark_dirty(&self) {
        let mut inner = self.inner.lock();
        if inner.multi_state != MultiState::Normal {
            inner.multi_state = MultiState::MultiDirty;
        }
    }

    /// Ends the transaction, clearing the queue and any WATCH snapshot,
    /// used by both DISCARD and the end of EXEC.
    pub fn end_multi(&self) -> Vec<CmdLine> {
        let mut inner = self.inner.lock();
        inner.multi_state = MultiState::Normal;
        inner.watching.clear();
        std::mem::take(&mut inner.queued)
    }

    pub fn queue_cmd(&self, cmd: CmdLine) {
        self.inner.lock().queued.push(cmd);
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().queued.len()
    }

    pub fn watch(&self, key: impl Into<String>, version: u32) {
        self.inner.lock().watching.insert(key.into(), version);
    }

    pub fn watching_snapshot(&self) -> HashMap<String, u32> {
        self.inner.lock().watching.clone()
    }

    pub fn clear_watch(&self) {
        self.inner.lock().watching.clear();
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> bool {
        self.inner.lock().subscriptions.insert(channel.into())
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.inner.lock().subscriptions.remove(channel)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.iter().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn role(&self) -> ConnRole {
        self.inner.lock().role
    }

    pub fn set_role(&self, role: ConnRole) {
        self.inner.lock().role = role;
    }
}

impl ConnectionSink for ConnState {
    fn conn_id(&self) -> u64 {
        self.id
    }

    fn push(&self, reply: &Reply) {
        (self.sink)(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> Arc<dyn Fn(&Reply) + Send + Sync> {
        Arc::new(|_r: &Reply| {})
    }

    #[test]
    fn multi_state_transitions() {
        let c = ConnState::new(dummy());
        assert_eq!(c.multi_state(), MultiState::Normal);
        c.start_multi();
        assert_eq!(c.multi_state(), MultiState::Multi);
        c.mark_dirty();
        assert_eq!(c.multi_state(), MultiState::MultiDirty);
        c.end_multi();
        assert_eq!(c.multi_state(), MultiState::Normal);
    }

    #[test]
    fn watch_and_snapshot() {
        let c = ConnState::new(dummy());
        c.watch("k", 5);
        assert_eq!(c.watching_snapshot().get("k"), Some(&5));
        c.clear_watch();
        assert!(c.watching_snapshot().is_empty());
    }

    #[test]
    fn subscriptions_are_deduplicated() {
        let c = ConnState::new(dummy());
        assert!(c.subscribe("ch"));
        assert!(!c.subscribe("ch"));
        assert_eq!(c.subscription_count(), 1);
        assert!(c.unsubscribe("ch"));
    }

    #[test]
    fn distinct_connections_get_distinct_ids() {
        let a = ConnState::new(dummy());
        let b = ConnState::new(dummy());
        assert_ne!(a.conn_id(), b.conn_id());
    }
}
