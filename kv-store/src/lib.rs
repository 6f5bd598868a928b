//! The sharded concurrent map (C1), the fixed key-lock table (C2), and
//! the expiration time wheel (C11).
//!
//! None of these know anything about the Redis command surface; they are
//! pure concurrency primitives, reused by `kv-engine` for the data map,
//! the TTL map, the version map, and — via the same [`lock_table::KeyLockTable`]
//! type — the pub/sub hub's per-channel subscriber lists.

pub mod fnv;
pub mod lock_table;
pub mod shard_map;
pub mod time_wheel;

pub use lock_table::KeyLockTable;
pub use shard_map::ShardedMap;
pub use time_wheel::TimeWheel;
