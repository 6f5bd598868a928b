//! The pub/sub hub (C7): `channel -> subscriber list`, guarded by the
//! same key-lock table the keyspace uses — channel names are locked
//! exactly like data keys, just over a disjoint namespace.

use std::collections::HashMap;
use std::sync::Arc;

use kv_proto::{ConnectionSink, Reply};
use kv_store::KeyLockTable;
use parking_lot::Mutex;

const DEFAULT_LOCK_TABLE_SIZE: usize = 256;

pub struct PubSubHub {
    locker: KeyLockTable,
    channels: Mutex<HashMap<String, HashMap<u64, Arc<dyn ConnectionSink + Send + Sync>>>>,
}

impl Default for PubSubHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubHub {
    pub fn new() -> Self {
        Self {
            locker: KeyLockTable::new(DEFAULT_LOCK_TABLE_SIZE),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `conn` to `channel`'s subscriber list, returning `false` if
    /// it was already subscribed.
    pub fn subscribe(&self, channel: &str, conn: Arc<dyn ConnectionSink + Send + Sync>) -> bool {
        let _guard = self.locker.lock(channel);
        let mut channels = self.channels.lock();
        let entry = channels.entry(channel.to_string()).or_default();
        entry.insert(conn.conn_id(), conn).is_none()
    }

    /// Removes `conn_id` from `channel`'s subscriber list, dropping the
    /// channel entirely once it has no subscribers left.
    pub fn unsubscribe(&self, channel: &str, conn_id: u64) -> bool {
        let _guard = self.locker.lock(channel);
        let mut channels = self.channels.lock();
        let Some(subs) = channels.get_mut(channel) else {
            return false;
        };
        let removed = subs.remove(&conn_id).is_some();
        if subs.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Removes `conn_id` from every channel it is subscribed to, used
    /// when a connection closes.
    pub fn unsubscribe_all(&self, conn_id: u64, channels: &[String]) {
        for channel in channels {
            self.unsubscribe(channel, conn_id);
        }
    }

    /// Writes `["message", channel, payload]` to every current
    /// subscriber and returns how many received it.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let _guard = self.locker.rlock(channel);
        let channels = self.channels.lock();
        let Some(subs) = channels.get(channel) else {
            return 0;
        };
        let message = Reply::array(vec![
            Reply::bulk(b"message".to_vec()),
            Reply::bulk(channel.as_bytes().to_vec()),
            Reply::bulk(payload.to_vec()),
        ]);
        for sub in subs.values() {
            sub.push(&message);
        }
        subs.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let _guard = self.locker.rlock(channel);
        self.channels.lock().get(channel).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        id: u64,
        received: Arc<AtomicUsize>,
    }

    impl ConnectionSink for CountingSink {
        fn conn_id(&self) -> u64 {
            self.id
        }

        fn push(&self, _reply: &Reply) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let hub = PubSubHub::new();
        let counter_a = Arc::new(AtomicUsize::new(0));
        let counter_b = Arc::new(AtomicUsize::new(0));
        hub.subscribe("ch", Arc::new(CountingSink { id: 1, received: counter_a.clone() }));
        hub.subscribe("ch", Arc::new(CountingSink { id: 2, received: counter_b.clone() }));
        assert_eq!(hub.publish("ch", b"hi"), 2);
        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_drops_the_channel_when_empty() {
        let hub = PubSubHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        hub.subscribe("ch", Arc::new(CountingSink { id: 1, received: counter }));
        assert!(hub.unsubscribe("ch", 1));
        assert_eq!(hub.subscriber_count("ch"), 0);
        assert_eq!(hub.publish("ch", b"hi"), 0);
    }

    #[test]
    fn resubscribing_the_same_connection_is_a_no_op() {
        let hub = PubSubHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(hub.subscribe("ch", Arc::new(CountingSink { id: 1, received: counter.clone() })));
        assert!(!hub.subscribe("ch", Arc::new(CountingSink { id: 1, received: counter })));
        assert_eq!(hub.subscriber_count("ch"), 1);
    }
}
