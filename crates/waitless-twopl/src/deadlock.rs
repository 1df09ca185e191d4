//! Wait-for graph traversal.
//!
//! A transaction names the single request it is blocked on through its
//! `conflict_lock` pointer. The detector runs a BFS from the caller's
//! collected predecessors: for each visited request, read its owner's
//! conflict pointer, walk that record's queue from the head toward the
//! conflict, and push the live nodes found there. Meeting a live request
//! owned by the caller closes a cycle.
//!
//! ## Racing conflict pointers
//!
//! No lock protects the pointers; they are double-read instead. If a walked
//! transaction's conflict pointer or its logical id moves mid-walk, that
//! transaction was not blocked after all, so the walk's findings are
//! discarded — the edge is simply not a deadlock edge *through this call*.
//! That is safe because the caller published its own conflict pointer before
//! calling in and holds it fixed until the detector returns: whichever
//! participant publishes the closing edge later will see the earlier
//! participant's fixed pointer and report the cycle from its own side. At
//! least one side always detects.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::manager::LockManager;
use crate::request::{LockState, RequestRef};
use crate::txn::Transaction;

impl LockManager {
    /// BFS over the wait-for graph; `true` when a cycle back to `caller`
    /// exists. Lock-free table mode.
    pub(crate) fn wait_graph_has_cycle(
        &self,
        caller: &Transaction,
        waiting: &[RequestRef],
    ) -> bool {
        let arena = self.arena();
        let caller_owner = caller.owner();

        let mut queue: VecDeque<RequestRef> = waiting
            .iter()
            .rev()
            .filter(|&&handle| arena.get(handle).state(Ordering::Acquire) != LockState::Obsolete)
            .copied()
            .collect();
        let mut visited_owners: HashSet<u32> = HashSet::new();

        while let Some(target_handle) = queue.pop_front() {
            let target = arena.get(target_handle);
            if visited_owners.contains(&target.owner().get())
                || target.state(Ordering::Acquire) == LockState::Obsolete
            {
                continue;
            }

            let trx = self.registry().by_owner(target.owner());
            // SeqCst pairs with the publication in acquire: of two racing
            // acquirers, at least one must observe the other's edge.
            let Some(conflict_handle) = trx.conflict_lock(Ordering::SeqCst) else {
                visited_owners.insert(target.owner().get());
                continue;
            };

            let conflict = arena.get(conflict_handle);
            let conflict_id = conflict.lock_id(Ordering::Acquire);
            let record = self.table().record(conflict.record_id());

            let mut found: Vec<RequestRef> = Vec::new();
            let mut cursor = record
                .head
                .load(Ordering::Acquire)
                .expect("a record with a waiter has a published head");

            while cursor != conflict_handle {
                // Conflict moved or its node was recycled: this transaction
                // is making progress, so it contributes no deadlock edge now.
                if trx.conflict_lock(Ordering::Acquire) != Some(conflict_handle)
                    || conflict.lock_id(Ordering::Acquire) != conflict_id
                {
                    found.clear();
                    break;
                }

                let node = arena.get(cursor);
                if node.owner() == caller_owner
                    && node.state(Ordering::Acquire) != LockState::Obsolete
                {
                    debug!(owner = %caller_owner, "wait-for cycle closed");
                    return true;
                }
                found.push(cursor);

                let advanced = node
                    .next
                    .load(Ordering::Acquire)
                    .filter(|&next| arena.get(next).lock_id(Ordering::Acquire) <= conflict_id);

                match advanced {
                    Some(next) => cursor = next,
                    None => {
                        // Walked off the logical range: a node on the way was
                        // recycled. Restart from the current head — unless
                        // the head itself moved to (or past) the conflict, in
                        // which case the wait is already over.
                        found.clear();
                        let head = record
                            .head
                            .load(Ordering::Acquire)
                            .expect("queue head never unpublishes");
                        if arena.get(head).lock_id(Ordering::Acquire) >= conflict_id {
                            break;
                        }
                        cursor = head;
                    }
                }
            }

            for handle in found {
                if arena.get(handle).state(Ordering::Acquire) != LockState::Obsolete {
                    queue.push_back(handle);
                }
            }

            visited_owners.insert(target.owner().get());
        }

        false
    }

    /// Same BFS under the global mutex: the queue cannot move, so the walk is
    /// a plain linear traversal with no stability checks.
    pub(crate) fn wait_graph_has_cycle_global(
        &self,
        caller: &Transaction,
        waiting: &[RequestRef],
    ) -> bool {
        let arena = self.arena();
        let caller_owner = caller.owner();

        let mut queue: VecDeque<RequestRef> = waiting
            .iter()
            .rev()
            .filter(|&&handle| arena.get(handle).state(Ordering::Acquire) != LockState::Obsolete)
            .copied()
            .collect();
        let mut visited_owners: HashSet<u32> = HashSet::new();

        while let Some(target_handle) = queue.pop_front() {
            let target = arena.get(target_handle);
            if visited_owners.contains(&target.owner().get())
                || target.state(Ordering::Acquire) == LockState::Obsolete
            {
                continue;
            }

            let trx = self.registry().by_owner(target.owner());
            let Some(conflict_handle) = trx.conflict_lock(Ordering::SeqCst) else {
                visited_owners.insert(target.owner().get());
                continue;
            };

            let conflict = arena.get(conflict_handle);
            let record = self.table().record(conflict.record_id());

            let mut cursor = record
                .head
                .load(Ordering::Acquire)
                .expect("a record with a waiter has a published head");
            while cursor != conflict_handle {
                let node = arena.get(cursor);
                if node.owner() == caller_owner
                    && node.state(Ordering::Acquire) != LockState::Obsolete
                {
                    debug!(owner = %caller_owner, "wait-for cycle closed");
                    return true;
                }
                if node.state(Ordering::Acquire) != LockState::Obsolete {
                    queue.push_back(cursor);
                }
                cursor = node
                    .next
                    .load(Ordering::Acquire)
                    .expect("global-mode queue is fully linked");
            }

            visited_owners.insert(target.owner().get());
        }

        false
    }
}
