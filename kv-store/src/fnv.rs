//! FNV-1 hashing over byte strings, ported from the `fnv32` helper shared
//! by `original_source/datastruct/dict/concurrent.go` and
//! `original_source/datastruct/lockmap/lock_map.go`. Both the sharded map
//! and the key-lock table use it to pick a slot; keeping one
//! implementation means a key always lands in the same shard index it
//! would have under the original, which matters for `GetShardByKey`-style
//! debugging even though nothing here depends on cross-process stability.
//!
//! Note this is FNV-1 (multiply then xor), not FNV-1a (xor then
//! multiply) — the Go source is explicit that the two must not be
//! confused.

const FNV_PRIME_32: u32 = 16_777_619;
const FNV_OFFSET_32: u32 = 2_166_136_261;

pub fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_32;
    for &b in data {
        hash = hash.wrapping_mul(FNV_PRIME_32);
        hash ^= b as u32;
    }
    hash
}

/// Map a hash code into `[0, table_size)`. Requires `table_size` to be a
/// power of two, matching `spread`'s `(tableSize - 1) & hashCode`.
pub fn spread(hash_code: u32, table_size: usize) -> usize {
    debug_assert!(table_size.is_power_of_two());
    (hash_code as usize) & (table_size - 1)
}

/// Round `hint` up to the next power of two, with a floor of 16 — the
/// same floor `computeCapacity` applies so a caller can't accidentally
/// create a single-shard map by passing a small hint.
pub fn compute_capacity(hint: usize) -> usize {
    if hint <= 16 {
        return 16;
    }
    hint.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_deterministic() {
        assert_eq!(fnv1_32(b"hello"), fnv1_32(b"hello"));
        assert_ne!(fnv1_32(b"hello"), fnv1_32(b"world"));
    }

    #[test]
    fn compute_capacity_floors_and_rounds() {
        assert_eq!(compute_capacity(0), 16);
        assert_eq!(compute_capacity(10), 16);
        assert_eq!(compute_capacity(17), 32);
        assert_eq!(compute_capacity(1024), 1024);
        assert_eq!(compute_capacity(1025), 2048);
    }

    #[test]
    fn spread_stays_in_bounds() {
        for key in ["a", "bb", "ccc", "some-longer-key-12345"] {
            let idx = spread(fnv1_32(key.as_bytes()), 64);
            assert!(idx < 64);
        }
    }
}
