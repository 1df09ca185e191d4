//! The lock manager: queueing, granting, and releasing record locks.
//!
//! ## Lock-free mode
//!
//! Insertion exchanges the newcomer into the record's tail, links the old
//! tail forward, then spins (with a yield hint) until the predecessor's
//! logical id is published before taking `predecessor_id + 1`. The
//! compatibility scan walks from the head toward the newcomer collecting
//! non-obsolete predecessors; because nodes can be recycled mid-walk, the
//! walk restarts from the current head whenever a node's id jumps past the
//! newcomer's or a `next` link goes missing. Head advancement on release is
//! serialized per record by a small mutex.
//!
//! ## Global-mutex mode
//!
//! A reference implementation serializing every table operation behind one
//! mutex. Queueing skips logical ids and the stall-and-restart dance; waiting
//! threads sleep on their transaction's condvar against the global mutex.
//! External behavior is identical to the lock-free mode.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, info, trace};
use waitless_types::RecordId;

use crate::record::{LockRecord, LockTable};
use crate::request::{LOCK_ID_UNSET, LockMode, LockState, RequestArena, RequestRef};
use crate::txn::{Transaction, TxnRegistry};

/// Inline capacity for predecessor-collection walks.
pub(crate) type PredecessorVec = SmallVec<[RequestRef; 16]>;

/// How the lock table is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMode {
    /// Wait-free tail insertion, mutex-serialized head advancement.
    #[default]
    LockFree,
    /// Everything behind one global mutex; reference behavior.
    GlobalMutex,
}

/// Manages the record table and every lock queue on it.
pub struct LockManager {
    table: LockTable,
    arena: RequestArena,
    registry: Arc<TxnRegistry>,
    mode: TableMode,
    /// Only locked in [`TableMode::GlobalMutex`].
    global: Mutex<()>,
}

impl LockManager {
    /// A manager over `record_count` records (ids `1..=record_count`).
    #[must_use]
    pub fn new(record_count: u32, mode: TableMode, registry: Arc<TxnRegistry>) -> Self {
        info!(record_count, ?mode, "lock table created");
        Self {
            table: LockTable::new(record_count),
            arena: RequestArena::new(),
            registry,
            mode,
            global: Mutex::new(()),
        }
    }

    /// The record table.
    #[must_use]
    pub fn table(&self) -> &LockTable {
        &self.table
    }

    /// The synchronization mode chosen at construction.
    #[must_use]
    pub fn mode(&self) -> TableMode {
        self.mode
    }

    pub(crate) fn arena(&self) -> &RequestArena {
        &self.arena
    }

    pub(crate) fn registry(&self) -> &TxnRegistry {
        &self.registry
    }

    /// Unlocked value peek, for post-run verification only.
    #[must_use]
    pub fn record_value(&self, id: RecordId) -> i64 {
        self.table.record(id).value()
    }

    /// Read the value of the record `handle` locks.
    ///
    /// # Panics
    ///
    /// Panics when `handle` is obsolete.
    #[must_use]
    pub fn read_record(&self, handle: RequestRef) -> i64 {
        let request = self.arena.get(handle);
        assert!(
            request.state(Ordering::Acquire) != LockState::Obsolete,
            "reading a record through an obsolete lock"
        );
        self.table.record(request.record_id()).value()
    }

    /// Apply `diff` to the record `handle` locks and return the new value.
    ///
    /// # Panics
    ///
    /// Panics unless `handle` is a live exclusive lock.
    pub fn change_record(&self, handle: RequestRef, diff: i64) -> i64 {
        let request = self.arena.get(handle);
        assert!(
            request.mode() == LockMode::Exclusive
                && request.state(Ordering::Acquire) != LockState::Obsolete,
            "record changes require a live exclusive lock"
        );
        self.table.record(request.record_id()).apply_diff(diff)
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// Queue a `mode` request on `record` for `trx` and wait until granted.
    ///
    /// Returns `None` iff a wait-for cycle through this request was detected;
    /// the caller must abort the transaction.
    pub fn acquire(
        &self,
        mode: LockMode,
        record: RecordId,
        trx: &Transaction,
    ) -> Option<RequestRef> {
        match self.mode {
            TableMode::LockFree => self.acquire_lock_free(mode, record, trx),
            TableMode::GlobalMutex => self.acquire_global(mode, record, trx),
        }
    }

    fn acquire_lock_free(
        &self,
        mode: LockMode,
        record_id: RecordId,
        trx: &Transaction,
    ) -> Option<RequestRef> {
        let record = self.table.record(record_id);
        let handle = self.obtain_request(trx, record_id, mode, true);
        let request = self.arena.get(handle);
        trx.push_acquired(handle);

        // Atomically take the tail slot, then link the old tail forward. The
        // link must land before the id: a fully linked queue with a pending
        // id is recoverable (spin below), ids without links are not.
        let previous = record.tail.swap(Some(handle), Ordering::AcqRel);

        if let Some(prev_handle) = previous {
            let prev = self.arena.get(prev_handle);
            prev.next.store(Some(handle), Ordering::Release);

            // The predecessor may still be waiting for its own id, and the
            // very first insertion may not have published the head yet.
            while prev.lock_id(Ordering::Acquire) == LOCK_ID_UNSET
                || record.head.load(Ordering::Acquire).is_none()
            {
                std::thread::yield_now();
            }

            request.set_lock_id(prev.lock_id(Ordering::Acquire) + 1, Ordering::Release);
            assert!(
                !prev.id_passed(Ordering::Acquire),
                "predecessor handed its id out twice"
            );
            prev.set_id_passed(Ordering::Release);
        } else {
            request.set_lock_id(0, Ordering::Release);
            record.head.store(Some(handle), Ordering::Release);
        }

        // Publish the conflict pointer after insertion but before any
        // deadlock check; the detector's correctness argument needs our edge
        // fixed while we look at everyone else's (see `deadlock`). SeqCst:
        // this store and the detector's loads of other transactions' conflict
        // pointers form a store-then-load pattern, and two racing acquirers
        // must not both miss each other's edge.
        assert!(
            trx.conflict_lock(Ordering::Acquire).is_none(),
            "transaction queued a second in-flight request"
        );
        trx.set_conflict_lock(Some(handle), Ordering::SeqCst);

        let predecessors = self.collect_predecessors(record, handle);

        // Scan the collected predecessors from the newest backwards; the
        // first live incompatible one decides whether we wait.
        let my_id = request.lock_id(Ordering::Acquire);
        for &pred_handle in predecessors.iter().rev() {
            let pred = self.arena.get(pred_handle);
            if pred.state(Ordering::Acquire) == LockState::Obsolete
                || pred.lock_id(Ordering::Acquire) > my_id
            {
                continue;
            }

            if mode == LockMode::Exclusive || pred.mode() == LockMode::Exclusive {
                request.set_state(LockState::Wait, Ordering::Release);

                // The predecessor may have been released while we flipped to
                // WAIT; re-check before committing to sleep.
                if pred.state(Ordering::Acquire) == LockState::Obsolete
                    || pred.lock_id(Ordering::Acquire) > my_id
                {
                    request.set_state(LockState::Active, Ordering::Release);
                    continue;
                }

                if self.wait_graph_has_cycle(trx, &predecessors) {
                    request.set_state(LockState::Obsolete, Ordering::Release);
                    trx.set_conflict_lock(None, Ordering::Release);
                    debug!(
                        owner = %trx.owner(),
                        record = %record_id,
                        "deadlock detected; acquisition abandoned"
                    );
                    return None;
                }
                break;
            }
        }

        if request.state(Ordering::Acquire) == LockState::Wait {
            trace!(owner = %trx.owner(), record = %record_id, "waiting for lock");
            let mut guard = trx.wait_mutex.lock();
            while !request.signaled(Ordering::Acquire) {
                trx.wait_cond.wait(&mut guard);
            }
            drop(guard);
            request.set_state(LockState::Active, Ordering::Release);
        }

        trx.set_conflict_lock(None, Ordering::Release);
        Some(handle)
    }

    /// Walk from the head to `handle`, collecting every node seen on the way.
    ///
    /// Nodes can be recycled mid-walk. Two symptoms reveal it: a node's id
    /// jumping past ours (the node was reused further down the queue), or a
    /// `next` link observed `None` on a node that is not the newcomer. Either
    /// way the nodes collected so far are suspect, so the walk restarts from
    /// the current head. The result is a superset of the requests logically
    /// before `handle`; the caller re-filters by id and state.
    fn collect_predecessors(&self, record: &LockRecord, handle: RequestRef) -> PredecessorVec {
        let my_id = self.arena.get(handle).lock_id(Ordering::Acquire);
        let mut collected = PredecessorVec::new();

        let mut cursor = record
            .head
            .load(Ordering::Acquire)
            .expect("queue head published before the compatibility scan");

        while cursor != handle {
            let node = self.arena.get(cursor);

            if node.lock_id(Ordering::Acquire) > my_id {
                collected.clear();
                cursor = record
                    .head
                    .load(Ordering::Acquire)
                    .expect("queue head never unpublishes");
                continue;
            }

            collected.push(cursor);

            match node.next.load(Ordering::Acquire) {
                Some(next) => cursor = next,
                None => {
                    collected.clear();
                    cursor = record
                        .head
                        .load(Ordering::Acquire)
                        .expect("queue head never unpublishes");
                }
            }
        }

        collected
    }

    fn acquire_global(
        &self,
        mode: LockMode,
        record_id: RecordId,
        trx: &Transaction,
    ) -> Option<RequestRef> {
        let record = self.table.record(record_id);
        let mut global_guard = self.global.lock();

        let handle = self.obtain_request(trx, record_id, mode, false);
        let request = self.arena.get(handle);
        trx.push_acquired(handle);

        // Plain tail append; the global mutex serializes everything.
        match record.tail.load(Ordering::Relaxed) {
            Some(prev_handle) => {
                self.arena
                    .get(prev_handle)
                    .next
                    .store(Some(handle), Ordering::Release);
            }
            None => record.head.store(Some(handle), Ordering::Release),
        }
        record.tail.store(Some(handle), Ordering::Release);

        assert!(
            trx.conflict_lock(Ordering::Acquire).is_none(),
            "transaction queued a second in-flight request"
        );
        trx.set_conflict_lock(Some(handle), Ordering::SeqCst);

        let mut predecessors = PredecessorVec::new();
        let mut cursor = record
            .head
            .load(Ordering::Acquire)
            .expect("queue head published under the global mutex");
        while cursor != handle {
            predecessors.push(cursor);
            cursor = self
                .arena
                .get(cursor)
                .next
                .load(Ordering::Acquire)
                .expect("global-mode queue is fully linked");
        }

        for &pred_handle in predecessors.iter().rev() {
            let pred = self.arena.get(pred_handle);
            if pred.state(Ordering::Acquire) == LockState::Obsolete {
                continue;
            }

            if mode == LockMode::Exclusive || pred.mode() == LockMode::Exclusive {
                request.set_state(LockState::Wait, Ordering::Release);

                if self.wait_graph_has_cycle_global(trx, &predecessors) {
                    request.set_state(LockState::Obsolete, Ordering::Release);
                    trx.set_conflict_lock(None, Ordering::Release);
                    debug!(
                        owner = %trx.owner(),
                        record = %record_id,
                        "deadlock detected; acquisition abandoned"
                    );
                    return None;
                }
                break;
            }
        }

        if request.state(Ordering::Acquire) == LockState::Wait {
            // Sleep against the global mutex so releasers can make progress.
            while !request.signaled(Ordering::Acquire) {
                trx.wait_cond.wait(&mut global_guard);
            }
            request.set_state(LockState::Active, Ordering::Release);
        }

        trx.set_conflict_lock(None, Ordering::Release);
        Some(handle)
    }

    /// Recycle a request from the transaction's pool or allocate a fresh one.
    fn obtain_request(
        &self,
        trx: &Transaction,
        record_id: RecordId,
        mode: LockMode,
        needs_id_pass: bool,
    ) -> RequestRef {
        trx.note_obtained();

        let mut pool = trx.pool.lock();
        let bucket = pool.entry(record_id).or_default();

        for &candidate in bucket.iter() {
            let request = self.arena.get(candidate);
            if request.can_recycle(needs_id_pass) {
                request.prepare(record_id, trx.owner(), mode);
                trx.note_recycled();
                return candidate;
            }
        }

        let fresh = self.arena.alloc(record_id, trx.owner(), mode);
        bucket.push(fresh);
        fresh
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Logically remove `handle` from its queue and wake unblocked
    /// successors. Idempotent for already-obsolete requests.
    pub fn release(&self, handle: RequestRef) {
        match self.mode {
            TableMode::LockFree => self.release_lock_free(handle),
            TableMode::GlobalMutex => self.release_global(handle),
        }
    }

    fn release_lock_free(&self, handle: RequestRef) {
        let request = self.arena.get(handle);
        let record = self.table.record(request.record_id());

        request.set_state(LockState::Obsolete, Ordering::Release);

        let _head_guard = record.head_mutex.lock();
        self.advance_head_and_wake(record, WakeDiscipline::OwnerMutex);
    }

    fn release_global(&self, handle: RequestRef) {
        let request = self.arena.get(handle);
        let record = self.table.record(request.record_id());

        let _global_guard: MutexGuard<'_, ()> = self.global.lock();

        request.set_state(LockState::Obsolete, Ordering::Release);
        self.advance_head_and_wake(record, WakeDiscipline::GlobalMutex);
    }

    /// Move the head past obsolete nodes and wake the new head (plus every
    /// consecutive shared request behind a shared head).
    ///
    /// Caller holds the record's head mutex (lock-free mode) or the global
    /// mutex, which serializes all head movement.
    fn advance_head_and_wake(&self, record: &LockRecord, discipline: WakeDiscipline) {
        let mut target = record
            .head
            .load(Ordering::Acquire)
            .expect("a released record has a published head");

        // Someone still live at the head: a later releaser will advance.
        if self.arena.get(target).state(Ordering::Acquire) != LockState::Obsolete {
            return;
        }

        loop {
            let prev = self.arena.get(target);
            let Some(next) = prev.next.load(Ordering::Acquire) else {
                // Queue exhausted; the head stays parked on the last node,
                // which can only be reaped once a successor moves past it.
                return;
            };
            record.head.store(Some(next), Ordering::Release);
            prev.set_head_passed(Ordering::Release);
            target = next;
            if self.arena.get(target).state(Ordering::Acquire) != LockState::Obsolete {
                break;
            }
        }

        let new_head = self.arena.get(target);
        self.wake_owner(target, discipline);

        // A shared head admits every consecutive shared request behind it.
        if new_head.mode() == LockMode::Shared {
            let mut cursor = new_head.next.load(Ordering::Acquire);
            while let Some(follower_handle) = cursor {
                let follower = self.arena.get(follower_handle);
                if follower.state(Ordering::Acquire) == LockState::Obsolete {
                    cursor = follower.next.load(Ordering::Acquire);
                    continue;
                }
                if follower.mode() == LockMode::Exclusive {
                    break;
                }
                self.wake_owner(follower_handle, discipline);
                cursor = follower.next.load(Ordering::Acquire);
            }
        }
    }

    fn wake_owner(&self, handle: RequestRef, discipline: WakeDiscipline) {
        let request = self.arena.get(handle);
        let trx = self.registry.by_owner(request.owner());
        match discipline {
            WakeDiscipline::OwnerMutex => {
                // The waiter checks `signaled` under its own mutex before
                // sleeping; setting it under the same mutex closes the race.
                let _guard = trx.wait_mutex.lock();
                request.set_signaled(Ordering::Release);
                if request.state(Ordering::Acquire) == LockState::Wait {
                    trx.wait_cond.notify_one();
                }
            }
            WakeDiscipline::GlobalMutex => {
                // Caller already holds the global mutex the waiter sleeps on.
                request.set_signaled(Ordering::Release);
                if request.state(Ordering::Acquire) == LockState::Wait {
                    trx.wait_cond.notify_one();
                }
            }
        }
    }
}

/// Which mutex a wakeup is synchronized against.
#[derive(Clone, Copy)]
enum WakeDiscipline {
    OwnerMutex,
    GlobalMutex,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnRegistry;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering as AtomicOrdering};
    use std::time::{Duration, Instant};

    fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    fn exclusive_lock_is_exclusive(mode: TableMode) {
        let registry = Arc::new(TxnRegistry::new());
        let manager = LockManager::new(1, mode, Arc::clone(&registry));
        let inside = AtomicI32::new(0);

        let manager = &manager;
        let registry = &registry;
        let inside = &inside;
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(move || {
                    let trx = registry.current();
                    for _ in 0..50 {
                        let handle = manager
                            .acquire(LockMode::Exclusive, RecordId::new(1), &trx)
                            .expect("a single-record exclusive workload has no cycles");
                        assert_eq!(
                            inside.fetch_add(1, AtomicOrdering::AcqRel),
                            0,
                            "two exclusive holders observed simultaneously"
                        );
                        std::thread::yield_now();
                        inside.fetch_sub(1, AtomicOrdering::AcqRel);
                        manager.release(handle);
                    }
                });
            }
        });
    }

    #[test]
    fn exclusive_excludes_lock_free() {
        exclusive_lock_is_exclusive(TableMode::LockFree);
    }

    #[test]
    fn exclusive_excludes_global_mutex() {
        exclusive_lock_is_exclusive(TableMode::GlobalMutex);
    }

    fn shared_locks_coexist(mode: TableMode) {
        let registry = Arc::new(TxnRegistry::new());
        let manager = LockManager::new(1, mode, Arc::clone(&registry));
        let second_reader_in = AtomicBool::new(false);

        let holder = registry.current();
        let held = manager
            .acquire(LockMode::Shared, RecordId::new(1), &holder)
            .unwrap();

        let manager_ref = &manager;
        let registry_ref = &registry;
        let flag = &second_reader_in;
        std::thread::scope(|scope| {
            scope.spawn(move || {
                let trx = registry_ref.current();
                let handle = manager_ref
                    .acquire(LockMode::Shared, RecordId::new(1), &trx)
                    .unwrap();
                flag.store(true, AtomicOrdering::Release);
                manager_ref.release(handle);
            });

            assert!(
                wait_until(Duration::from_secs(5), || flag.load(AtomicOrdering::Acquire)),
                "a second shared request must be granted while the first is held"
            );
        });

        manager.release(held);
    }

    #[test]
    fn shared_coexist_lock_free() {
        shared_locks_coexist(TableMode::LockFree);
    }

    #[test]
    fn shared_coexist_global_mutex() {
        shared_locks_coexist(TableMode::GlobalMutex);
    }

    /// An exclusive holder, two queued shared requests, then a queued
    /// exclusive one. Releasing the holder must wake both shared requests
    /// together and nothing else; releasing those must wake the exclusive.
    fn shared_batch_wakes_before_next_exclusive(mode: TableMode) {
        let registry = Arc::new(TxnRegistry::new());
        let manager = LockManager::new(1, mode, Arc::clone(&registry));
        let readers_in = AtomicU32::new(0);
        let writer_in = AtomicBool::new(false);
        let readers_release = AtomicBool::new(false);

        let holder = registry.current();
        let held = manager
            .acquire(LockMode::Exclusive, RecordId::new(1), &holder)
            .unwrap();

        let manager_ref = &manager;
        let registry_ref = &registry;
        let readers_in_ref = &readers_in;
        let writer_in_ref = &writer_in;
        let readers_release_ref = &readers_release;
        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(move || {
                    let trx = registry_ref.current();
                    let handle = manager_ref
                        .acquire(LockMode::Shared, RecordId::new(1), &trx)
                        .unwrap();
                    readers_in_ref.fetch_add(1, AtomicOrdering::AcqRel);
                    while !readers_release_ref.load(AtomicOrdering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    manager_ref.release(handle);
                });
                std::thread::sleep(Duration::from_millis(50));
            }

            scope.spawn(move || {
                let trx = registry_ref.current();
                let handle = manager_ref
                    .acquire(LockMode::Exclusive, RecordId::new(1), &trx)
                    .unwrap();
                writer_in_ref.store(true, AtomicOrdering::Release);
                manager_ref.release(handle);
            });
            std::thread::sleep(Duration::from_millis(100));

            // Everyone still queued behind the exclusive holder.
            assert_eq!(readers_in.load(AtomicOrdering::Acquire), 0);
            assert!(!writer_in.load(AtomicOrdering::Acquire));

            manager.release(held);

            assert!(
                wait_until(Duration::from_secs(5), || {
                    readers_in.load(AtomicOrdering::Acquire) == 2
                }),
                "both shared requests must be admitted together"
            );
            std::thread::sleep(Duration::from_millis(50));
            assert!(
                !writer_in.load(AtomicOrdering::Acquire),
                "the queued exclusive request must keep waiting behind the readers"
            );

            readers_release.store(true, AtomicOrdering::Release);
            assert!(
                wait_until(Duration::from_secs(5), || {
                    writer_in.load(AtomicOrdering::Acquire)
                }),
                "the exclusive request must be admitted after the readers leave"
            );
        });
    }

    #[test]
    fn shared_batch_wakeup_lock_free() {
        shared_batch_wakes_before_next_exclusive(TableMode::LockFree);
    }

    #[test]
    fn shared_batch_wakeup_global_mutex() {
        shared_batch_wakes_before_next_exclusive(TableMode::GlobalMutex);
    }

    /// Lock ids are dense and FIFO per record in lock-free mode.
    #[test]
    fn lock_ids_are_assigned_in_queue_order() {
        let registry = Arc::new(TxnRegistry::new());
        let manager = LockManager::new(1, TableMode::LockFree, Arc::clone(&registry));
        let trx = registry.current();

        let mut handles = Vec::new();
        for expected_id in 0..4_u64 {
            let handle = manager
                .acquire(LockMode::Shared, RecordId::new(1), &trx)
                .unwrap();
            assert_eq!(
                manager.arena().get(handle).lock_id(Ordering::Acquire),
                expected_id
            );
            handles.push(handle);
        }
        for handle in handles {
            manager.release(handle);
        }
    }

    #[test]
    fn record_values_change_only_through_exclusive_locks() {
        let registry = Arc::new(TxnRegistry::new());
        let manager = LockManager::new(2, TableMode::LockFree, Arc::clone(&registry));
        let trx = registry.current();

        let shared = manager
            .acquire(LockMode::Shared, RecordId::new(1), &trx)
            .unwrap();
        assert_eq!(manager.read_record(shared), 100);
        manager.release(shared);

        let exclusive = manager
            .acquire(LockMode::Exclusive, RecordId::new(2), &trx)
            .unwrap();
        assert_eq!(manager.change_record(exclusive, -25), 75);
        assert_eq!(manager.read_record(exclusive), 75);
        manager.release(exclusive);
        assert_eq!(manager.record_value(RecordId::new(2)), 75);
    }
}
