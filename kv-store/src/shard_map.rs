//! A fixed-shard-count concurrent map, ported from `ConcurrentDict` in
//! `original_source/datastruct/dict/concurrent.go`.
//!
//! Each shard is an independent `RwLock<HashMap<...>>`; a key's shard is
//! fixed at construction time by `fnv1_32(key) & (shard_count - 1)`, so
//! unlike `kv-engine`'s key-lock table (which serializes one logical
//! mutation end-to-end) this only ever protects the map's own bucket
//! structure for the instant of one `get`/`insert`/`remove` call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use rand::Rng;

use crate::fnv::{compute_capacity, fnv1_32, spread};

struct Shard<V> {
    map: RwLock<HashMap<String, V>>,
}

/// A `String`-keyed map sharded across a fixed number of independently
/// lockable buckets.
pub struct ShardedMap<V> {
    shards: Vec<Shard<V>>,
    count: AtomicI64,
}

impl<V: Clone> ShardedMap<V> {
    /// `shard_hint` is rounded up to a power of two with a floor of 16,
    /// mirroring `MakeConcurrentDict`.
    pub fn new(shard_hint: usize) -> Self {
        let n = compute_capacity(shard_hint);
        let shards = (0..n)
            .map(|_| Shard {
                map: RwLock::new(HashMap::new()),
            })
            .collect();
        Self {
            shards,
            count: AtomicI64::new(0),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        spread(fnv1_32(key.as_bytes()), self.shards.len())
    }

    fn shard(&self, key: &str) -> &Shard<V> {
        &self.shards[self.shard_index(key)]
    }

    pub fn len(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).map.read().get(key).cloned()
    }

    /// Run `f` against the value behind `key` while holding the shard's
    /// write lock, without cloning it out first. Used when the stored
    /// value is an expensive-to-clone container (a list, a hash, a
    /// sorted set) that a single command mutates in place.
    pub fn mutate<R>(&self, key: &str, f: impl FnOnce(Option<&mut V>) -> R) -> R {
        let mut guard = self.shard(key).map.write();
        f(guard.get_mut(key))
    }

    /// Unconditional insert. Returns `true` if this created a new entry
    /// (mirrors `Put`'s `1`/`0` result).
    pub fn put(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let mut guard = self.shard(&key).map.write();
        let is_new = guard.insert(key, value).is_none();
        drop(guard);
        if is_new {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
        is_new
    }

    /// Insert only if absent. Returns `true` if inserted.
    pub fn put_if_absent(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let mut guard = self.shard(&key).map.write();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, value);
        drop(guard);
        self.count.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Overwrite only if present. Returns `true` if updated.
    pub fn put_if_exists(&self, key: &str, value: V) -> bool {
        let mut guard = self.shard(key).map.write();
        if !guard.contains_key(key) {
            return false;
        }
        guard.insert(key.to_string(), value);
        true
    }

    /// Returns `true` if a value was removed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shard(key).map.write().remove(key).is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Remove several keys at once; returns how many were actually
    /// present.
    pub fn removes(&self, keys: &[impl AsRef<str>]) -> usize {
        keys.iter().filter(|k| self.remove(k.as_ref())).count()
    }

    /// Visit every entry, one shard at a time under its read lock. `f`
    /// returns `false` to stop early, mirroring `ForEach`'s consumer
    /// contract.
    pub fn for_each(&self, mut f: impl FnMut(&str, &V) -> bool) {
        for shard in &self.shards {
            let guard = shard.map.read();
            for (k, v) in guard.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len().max(0) as usize);
        self.for_each(|k, _| {
            out.push(k.to_string());
            true
        });
        out
    }

    /// Pick `limit` keys at random, with repeats allowed across shards
    /// (mirrors `RandomKeys`). If `limit` is at least the map's size,
    /// every key is returned.
    pub fn random_keys(&self, limit: usize) -> Vec<String> {
        if self.shards.is_empty() || limit == 0 {
            return Vec::new();
        }
        if limit as i64 >= self.len() {
            return self.keys();
        }
        let mut rng = rand::rng();
        let mut out = Vec::with_capacity(limit);
        for _ in 0..limit {
            let shard = &self.shards[rng.random_range(0..self.shards.len())];
            let guard = shard.map.read();
            if let Some(k) = guard.keys().choose(&mut rng) {
                out.push(k.clone());
            }
        }
        out
    }

    /// Like [`Self::random_keys`] but deduplicated.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        if limit as i64 >= self.len() {
            return self.keys();
        }
        let mut seen = std::collections::HashSet::with_capacity(limit);
        let mut rng = rand::rng();
        let mut guard_order: Vec<usize> = (0..self.shards.len()).collect();
        use rand::seq::SliceRandom;
        guard_order.shuffle(&mut rng);
        'outer: for idx in guard_order.into_iter().cycle() {
            if seen.len() >= limit {
                break;
            }
            let guard = self.shards[idx].map.read();
            for k in guard.keys() {
                if seen.insert(k.clone()) && seen.len() >= limit {
                    break 'outer;
                }
            }
            if guard.is_empty() {
                continue;
            }
        }
        seen.into_iter().collect()
    }

    /// Drop every entry, replacing internal state the way `Clear` swaps
    /// in a fresh `ConcurrentDict`.
    pub fn clear(&self) {
        tracing::debug!(shards = self.shards.len(), "clearing sharded map");
        for shard in &self.shards {
            shard.map.write().clear();
        }
        self.count.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_reports_new_vs_overwrite() {
        let m: ShardedMap<i32> = ShardedMap::new(16);
        assert!(m.put("a", 1));
        assert!(!m.put("a", 2));
        assert_eq!(m.get("a"), Some(2));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn put_if_absent_and_exists() {
        let m: ShardedMap<i32> = ShardedMap::new(16);
        assert!(m.put_if_absent("k", 1));
        assert!(!m.put_if_absent("k", 2));
        assert_eq!(m.get("k"), Some(1));
        assert!(m.put_if_exists("k", 3));
        assert_eq!(m.get("k"), Some(3));
        assert!(!m.put_if_exists("missing", 1));
    }

    #[test]
    fn remove_updates_count() {
        let m: ShardedMap<i32> = ShardedMap::new(16);
        m.put("a", 1);
        m.put("b", 2);
        assert!(m.remove("a"));
        assert!(!m.remove("a"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn mutate_runs_against_stored_value_in_place() {
        let m: ShardedMap<Vec<i32>> = ShardedMap::new(16);
        m.put("list", vec![1, 2]);
        m.mutate("list", |v| v.unwrap().push(3));
        assert_eq!(m.get("list"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn for_each_visits_every_entry() {
        let m: ShardedMap<i32> = ShardedMap::new(16);
        for i in 0..50 {
            m.put(format!("k{i}"), i);
        }
        let mut seen = 0;
        m.for_each(|_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 50);
    }

    #[test]
    fn compute_capacity_floors_shard_count() {
        let m: ShardedMap<i32> = ShardedMap::new(1);
        assert_eq!(m.shards.len(), 16);
    }
}
