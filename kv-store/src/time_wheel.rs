//! A 1-second-resolution, fixed-slot time wheel for deferred callbacks,
//! ported from `original_source/lib/timewheel/delay.go`. The engine uses
//! one instance to schedule "re-check this key's TTL" jobs (§4.1); unlike
//! the original's package-level singleton, this crate hands back an
//! owned [`TimeWheel`] so `kv-server` can own its lifetime explicitly.
//!
//! The wheel itself is synchronous and has no opinion on what drives its
//! clock — `kv-server`'s bootstrap (§4.14) ticks it once a second from a
//! `tokio::time::interval`, the same way the original's `init()` spawned
//! a goroutine calling `tw.Start()`.

use std::collections::HashMap;

use parking_lot::Mutex;

const DEFAULT_SLOT_COUNT: usize = 3600;

type Job = Box<dyn FnOnce() + Send>;

struct Task {
    key: String,
    /// Remaining full trips around the wheel before this task fires.
    round: u64,
    job: Job,
}

struct Inner {
    slots: Vec<Vec<Task>>,
    /// Which slot the next tick will process.
    cursor: usize,
    /// key -> slot, so `cancel` doesn't have to scan every slot.
    location: HashMap<String, usize>,
}

/// A time wheel with `slot_count` one-second slots (3600 by default, i.e.
/// one hour of lookahead before a task needs more than one trip around).
pub struct TimeWheel {
    inner: Mutex<Inner>,
    slot_count: usize,
}

impl TimeWheel {
    pub fn new() -> Self {
        Self::with_slot_count(DEFAULT_SLOT_COUNT)
    }

    pub fn with_slot_count(slot_count: usize) -> Self {
        assert!(slot_count > 0);
        Self {
            inner: Mutex::new(Inner {
                slots: (0..slot_count).map(|_| Vec::new()).collect(),
                cursor: 0,
                location: HashMap::new(),
            }),
            slot_count,
        }
    }

    /// Schedule `job` to run after `delay_secs` seconds, addressable by
    /// `key` for later cancellation. A second `delay` under the same key
    /// replaces the first, mirroring `Delay`'s use of `AddJob` keyed by
    /// name.
    pub fn delay(&self, delay_secs: u64, key: impl Into<String>, job: Job) {
        let key = key.into();
        let mut inner = self.inner.lock();
        let offset = delay_secs as usize % inner.slots.len();
        let round = delay_secs as usize / inner.slots.len();
        let slot = (inner.cursor + offset) % inner.slots.len();

        if let Some(&old_slot) = inner.location.get(&key) {
            inner.slots[old_slot].retain(|t| t.key != key);
        }
        inner.location.insert(key.clone(), slot);
        inner.slots[slot].push(Task {
            key,
            round: round as u64,
            job,
        });
    }

    /// Cancel a previously scheduled job by key. No-op if it already
    /// fired or was never scheduled.
    pub fn cancel(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.location.remove(key) {
            inner.slots[slot].retain(|t| t.key != key);
        }
    }

    /// Advance the wheel by one second, running (and consuming) every
    /// task whose round has reached zero in the slot under the cursor.
    /// Jobs run synchronously, on the caller's thread, in the order they
    /// were scheduled into this slot.
    pub fn tick(&self) {
        let due = {
            let mut inner = self.inner.lock();
            let slot = inner.cursor;
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for mut task in inner.slots[slot].drain(..) {
                if task.round == 0 {
                    inner.location.remove(&task.key);
                    due.push(task);
                } else {
                    task.round -= 1;
                    remaining.push(task);
                }
            }
            inner.slots[slot] = remaining;
            inner.cursor = (inner.cursor + 1) % self.slot_count;
            due
        };
        if !due.is_empty() {
            tracing::trace!(count = due.len(), "time wheel firing due tasks");
        }
        for task in due {
            (task.job)();
        }
    }
}

impl Default for TimeWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_after_the_requested_number_of_ticks() {
        let wheel = TimeWheel::with_slot_count(8);
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        wheel.delay(3, "k", Box::new(move || f.store(true, Ordering::SeqCst)));
        wheel.tick();
        wheel.tick();
        assert!(!fired.load(Ordering::SeqCst));
        wheel.tick();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_prevents_firing() {
        let wheel = TimeWheel::with_slot_count(8);
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        wheel.delay(2, "k", Box::new(move || f.store(true, Ordering::SeqCst)));
        wheel.cancel("k");
        wheel.tick();
        wheel.tick();
        wheel.tick();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn rescheduling_under_the_same_key_replaces_the_first() {
        let wheel = TimeWheel::with_slot_count(8);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c1 = count.clone();
        wheel.delay(5, "k", Box::new(move || { c1.fetch_add(1, Ordering::SeqCst); }));
        let c2 = count.clone();
        wheel.delay(1, "k", Box::new(move || { c2.fetch_add(1, Ordering::SeqCst); }));
        wheel.tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        for _ in 0..8 {
            wheel.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handles_delays_longer_than_one_trip_around() {
        let wheel = TimeWheel::with_slot_count(4);
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        wheel.delay(10, "k", Box::new(move || f.store(true, Ordering::SeqCst)));
        for _ in 0..9 {
            wheel.tick();
            assert!(!fired.load(Ordering::SeqCst));
        }
        wheel.tick();
        assert!(fired.load(Ordering::SeqCst));
    }
}
