//! A fixed-size table of read-write locks addressed by key hash, ported
//! from `Locks` in `original_source/datastruct/lockmap/lock_map.go`.
//!
//! The table itself never stores data — it exists so that unrelated keys
//! (almost always) map to different slots and can be locked
//! independently, while a command touching several keys at once can
//! acquire all of them without risking the classic lock-order deadlock:
//! slots are always acquired in ascending index order and released in
//! whatever order drop happens to run (release order doesn't affect
//! correctness, only acquisition order does).
//!
//! Reused as-is for the pub/sub hub's per-channel subscriber lists (§4.7)
//! — nothing here is specific to the data keyspace.

use std::collections::BTreeSet;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::fnv::{compute_capacity, fnv1_32, spread};

pub struct KeyLockTable {
    table: Vec<RwLock<()>>,
}

/// One batch of held locks, released when dropped. Carries no borrow of
/// the table's contents; it only exists to serialize access to a given
/// set of key slots for as long as it's alive.
pub enum Guard<'a> {
    Write(RwLockWriteGuard<'a, ()>),
    Read(RwLockReadGuard<'a, ()>),
}

#[derive(Default)]
pub struct MultiGuard<'a> {
    guards: Vec<Guard<'a>>,
}

impl KeyLockTable {
    /// `size_hint` is rounded up to a power of two with a floor of 16, so
    /// `spread`'s masking mask is always valid.
    pub fn new(size_hint: usize) -> Self {
        let n = compute_capacity(size_hint);
        Self {
            table: (0..n).map(|_| RwLock::new(())).collect(),
        }
    }

    fn slot_index(&self, key: &str) -> usize {
        spread(fnv1_32(key.as_bytes()), self.table.len())
    }

    pub fn lock(&self, key: &str) -> RwLockWriteGuard<'_, ()> {
        self.table[self.slot_index(key)].write()
    }

    pub fn rlock(&self, key: &str) -> RwLockReadGuard<'_, ()> {
        self.table[self.slot_index(key)].read()
    }

    /// Deduplicated, ascending-order slot indices for a key set. When
    /// `reverse` is set the order is descending — `original_source`
    /// unlocks in the opposite order it locked in, though since release
    /// order doesn't matter for correctness this is kept only so the
    /// acquire/release symmetry reads the same way it does there.
    fn to_lock_indices(&self, keys: &[impl AsRef<str>], reverse: bool) -> Vec<usize> {
        let mut set = BTreeSet::new();
        for k in keys {
            set.insert(self.slot_index(k.as_ref()));
        }
        if reverse {
            set.into_iter().rev().collect()
        } else {
            set.into_iter().collect()
        }
    }

    /// Acquire every key's slot exclusively, in ascending index order.
    pub fn lock_all<'a>(&'a self, keys: &[impl AsRef<str>]) -> MultiGuard<'a> {
        let indices = self.to_lock_indices(keys, false);
        let guards = indices
            .into_iter()
            .map(|i| Guard::Write(self.table[i].write()))
            .collect();
        MultiGuard { guards }
    }

    /// Acquire every key's slot for shared read access, in ascending
    /// index order.
    pub fn rlock_all<'a>(&'a self, keys: &[impl AsRef<str>]) -> MultiGuard<'a> {
        let indices = self.to_lock_indices(keys, false);
        let guards = indices
            .into_iter()
            .map(|i| Guard::Read(self.table[i].read()))
            .collect();
        MultiGuard { guards }
    }

    /// Lock `write_keys` exclusively and `read_keys` for shared access,
    /// as one ordered batch — the `RWLock` combinator from
    /// `lock_map.go`. A slot needed by both sets is acquired exclusively
    /// (write wins), and every slot is still acquired in a single
    /// ascending pass so two callers locking overlapping key sets can
    /// never deadlock against each other.
    pub fn rw_lock_all<'a>(
        &'a self,
        write_keys: &[impl AsRef<str>],
        read_keys: &[impl AsRef<str>],
    ) -> MultiGuard<'a> {
        let write_indices: BTreeSet<usize> = write_keys
            .iter()
            .map(|k| self.slot_index(k.as_ref()))
            .collect();
        let mut all: BTreeSet<usize> = write_indices.clone();
        for k in read_keys {
            all.insert(self.slot_index(k.as_ref()));
        }
        let guards = all
            .into_iter()
            .map(|i| {
                if write_indices.contains(&i) {
                    Guard::Write(self.table[i].write())
                } else {
                    Guard::Read(self.table[i].read())
                }
            })
            .collect();
        MultiGuard { guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_lock_and_rlock() {
        let t = KeyLockTable::new(16);
        let _g = t.lock("k1");
        drop(_g);
        let _r1 = t.rlock("k1");
        let _r2 = t.rlock("k1");
    }

    #[test]
    fn rw_lock_all_dedupes_and_write_wins() {
        let t = KeyLockTable::new(16);
        let writes = vec!["a".to_string(), "b".to_string()];
        let reads = vec!["b".to_string(), "c".to_string()];
        let batch = t.rw_lock_all(&writes, &reads);
        assert_eq!(batch.guards.len(), 3);
        let write_count = batch
            .guards
            .iter()
            .filter(|g| matches!(g, Guard::Write(_)))
            .count();
        assert_eq!(write_count, 2);
    }

    #[test]
    fn lock_all_holds_every_distinct_slot() {
        let t = KeyLockTable::new(1024);
        let keys = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let batch = t.lock_all(&keys);
        assert!(batch.guards.len() <= 3);
        assert!(!batch.guards.is_empty());
    }
}
