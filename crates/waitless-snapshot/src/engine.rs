//! The wait-free snapshot engine.
//!
//! [`AtomicSnapshot`] owns one packed register and one snapshot holder per
//! writer. A scan double-collects the register array until it observes a
//! clean pass; any writer seen to move twice within one scan must have
//! published a snapshot whose linearization point falls inside this scan's
//! execution interval, so the scan borrows that snapshot instead of looping
//! further. Termination therefore takes at most N+1 collects.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::RwLock;
use tracing::debug;
use waitless_types::CacheAligned;

use crate::holder::SnapshotHolder;
use crate::register::{PackedRegister, RegisterWord, Snapshot};

/// Writer-slot registry, keyed by OS thread id.
#[derive(Default)]
struct SlotRegistry {
    by_thread: HashMap<ThreadId, usize>,
    next_index: usize,
}

/// A fixed array of single-writer registers supporting wait-free consistent
/// scans.
///
/// Construct with the writer count, have each writer claim a slot via
/// [`register_thread`](Self::register_thread), then interleave
/// [`update`](Self::update) and [`scan`](Self::scan) freely from any thread.
pub struct AtomicSnapshot {
    registers: Box<[CacheAligned<PackedRegister>]>,
    holders: Box<[SnapshotHolder]>,
    registry: RwLock<SlotRegistry>,
}

impl AtomicSnapshot {
    /// An engine with `writer_count` register slots.
    ///
    /// # Panics
    ///
    /// Panics when `writer_count` is zero.
    #[must_use]
    pub fn new(writer_count: usize) -> Self {
        assert!(writer_count > 0, "snapshot engine needs at least one writer");
        Self {
            registers: (0..writer_count)
                .map(|_| CacheAligned::new(PackedRegister::new()))
                .collect(),
            holders: (0..writer_count)
                .map(|_| SnapshotHolder::new(writer_count))
                .collect(),
            registry: RwLock::new(SlotRegistry::default()),
        }
    }

    /// Number of writer slots.
    #[must_use]
    pub fn writer_count(&self) -> usize {
        self.registers.len()
    }

    /// Claim (or look up) the calling thread's writer slot.
    ///
    /// Idempotent per thread: the first call assigns the next free index in
    /// registration order, later calls return the same index. The lookup
    /// takes the registry's shared lock; only first-time registration takes
    /// the exclusive lock.
    ///
    /// # Panics
    ///
    /// Panics when more distinct threads register than there are slots.
    pub fn register_thread(&self) -> usize {
        let tid = thread::current().id();
        {
            let registry = self.registry.read();
            if let Some(&index) = registry.by_thread.get(&tid) {
                return index;
            }
        }

        let mut registry = self.registry.write();
        if let Some(&index) = registry.by_thread.get(&tid) {
            return index;
        }
        let index = registry.next_index;
        assert!(
            index < self.registers.len(),
            "more writer threads registered than slots"
        );
        registry.next_index += 1;
        registry.by_thread.insert(tid, index);
        debug!(index, "writer thread registered");
        index
    }

    /// Wait-free consistent snapshot of all registers.
    pub fn scan(&self) -> Snapshot {
        let writer_count = self.registers.len();
        let mut change_counts = vec![0_u8; writer_count];

        let mut previous: Vec<RegisterWord> =
            self.registers.iter().map(|r| r.load_word()).collect();

        loop {
            let mut dirty = false;
            let mut current = Vec::with_capacity(writer_count);

            for (index, register) in self.registers.iter().enumerate() {
                let word = register.load_word();

                if word != previous[index] {
                    dirty = true;
                    change_counts[index] += 1;

                    // Twice moved: writer `index` published a snapshot inside
                    // our execution interval. Borrow it.
                    if change_counts[index] == 2 {
                        let guard = self.holders[index].acquire();
                        let borrowed = guard.to_snapshot();
                        debug!(writer = index, "scan borrowed a published snapshot");
                        return borrowed;
                    }
                }

                current.push(word);
            }

            if !dirty {
                return Snapshot::from_words(current);
            }

            previous = current;
        }
    }

    /// Publish the caller's snapshot, then write `value` into slot `index`.
    ///
    /// The publish-before-write order is what entitles concurrent scanners to
    /// borrow this writer's snapshot after observing it change twice.
    ///
    /// Only the thread that registered `index` may call this for that index.
    pub fn update(&self, value: i32, index: usize) {
        let snapshot = self.scan();
        self.holders[index].exchange(&snapshot);
        self.registers[index].write(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn single_writer_update_then_scan() {
        let engine = AtomicSnapshot::new(1);
        let index = engine.register_thread();
        engine.update(7, index);
        let snap = engine.scan();
        assert_eq!(snap.values().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn register_thread_is_idempotent() {
        let engine = AtomicSnapshot::new(2);
        let first = engine.register_thread();
        let second = engine.register_thread();
        assert_eq!(first, second);
    }

    #[test]
    fn scan_before_any_update_is_all_zero() {
        let engine = AtomicSnapshot::new(3);
        let snap = engine.scan();
        assert_eq!(snap.values().collect::<Vec<_>>(), vec![0, 0, 0]);
    }

    #[test]
    fn sequential_updates_are_observed_in_order() {
        let engine = AtomicSnapshot::new(2);
        let index = engine.register_thread();
        engine.update(10, index);
        assert_eq!(engine.scan().value(0), 10);
        engine.update(20, index);
        let snap = engine.scan();
        assert_eq!(snap.value(0), 20);
        assert_eq!(snap.value(1), 0);
    }

    /// Two writers publish strictly increasing sequences while a scanner
    /// repeatedly collects. Every observed value must have been written, and
    /// successive scans must never observe a slot moving backwards.
    #[test]
    fn concurrent_scans_are_monotone_per_slot() {
        let engine = Arc::new(AtomicSnapshot::new(2));
        let stop = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..2_i32)
            .map(|writer| {
                let engine = Arc::clone(&engine);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let index = engine.register_thread();
                    let mut sequence = 0_i32;
                    while !stop.load(Ordering::Relaxed) {
                        sequence += 1;
                        engine.update(writer * 1_000_000 + sequence, index);
                    }
                })
            })
            .collect();

        let mut last = vec![0_i32; 2];
        for _ in 0..2_000 {
            let snap = engine.scan();
            for slot in 0..2 {
                let value = snap.value(slot);
                if value != 0 {
                    // Writers emit `writer * 1_000_000 + sequence` with
                    // sequence >= 1; anything else was never written.
                    let writer = value / 1_000_000;
                    let sequence = value % 1_000_000;
                    assert!(
                        (writer == 0 || writer == 1) && sequence > 0,
                        "slot {slot} observed a value that was never written: {value}"
                    );
                }
                assert!(
                    value >= last[slot],
                    "slot {slot} moved backwards: {} -> {value}",
                    last[slot]
                );
                last[slot] = value;
            }
        }

        stop.store(true, Ordering::Relaxed);
        for handle in writers {
            handle.join().unwrap();
        }
    }

    /// With one writer hammering updates, scans from another thread keep
    /// terminating (the borrow fallback bounds the collect loop).
    #[test]
    fn scans_terminate_under_write_pressure() {
        let engine = Arc::new(AtomicSnapshot::new(2));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let index = engine.register_thread();
                let mut v = 0_i32;
                while !stop.load(Ordering::Relaxed) {
                    v = v.wrapping_add(1);
                    engine.update(v, index);
                }
            })
        };

        for _ in 0..5_000 {
            let snap = engine.scan();
            assert_eq!(snap.len(), 2);
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
