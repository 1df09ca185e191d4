//! Transaction lifecycle: begin / find / update / abort / commit.
//!
//! A transaction is the per-thread face of the lock manager. The registry
//! resolves the calling OS thread to its [`Transaction`] node (lazily created
//! under the registry's exclusive lock, looked up under the shared lock on
//! every later call). Commits draw ids from a global counter capped by
//! `last_commit_id`; a commit that draws past the cap rolls back instead and
//! reports the workload finished.
//!
//! Every committed transaction appends one line to its thread's commit log,
//! `thread<N>.txt`: the commit id, the record ids it touched in touch order,
//! then the record values observed at commit time.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::debug;
use waitless_error::{Result, WaitlessError};
use waitless_types::{OwnerId, RecordId};

use crate::manager::{LockManager, TableMode};
use crate::request::{AtomicRequestRef, LockMode, LockState, RequestRef};

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Per-thread transaction state.
///
/// Shared with other threads only through the registry: releasers take the
/// wait mutex to wake the owner, and the deadlock detector reads the conflict
/// pointer. Everything else is touched by the owning thread alone.
pub struct Transaction {
    owner: OwnerId,
    /// 1-based registration order; names the commit log file.
    thread_number: u32,
    /// The single request this transaction is currently blocked on.
    conflict: AtomicRequestRef,
    pub(crate) wait_mutex: Mutex<()>,
    pub(crate) wait_cond: Condvar,
    /// Requests acquired by the running transaction, in acquisition order.
    acquired: Mutex<Vec<RequestRef>>,
    /// Recycle pool: every request this thread ever allocated, per record.
    pub(crate) pool: Mutex<HashMap<RecordId, Vec<RequestRef>>>,
    obtained_total: AtomicU64,
    recycled_total: AtomicU64,
}

impl Transaction {
    fn new(owner: OwnerId, thread_number: u32) -> Self {
        Self {
            owner,
            thread_number,
            conflict: AtomicRequestRef::none(),
            wait_mutex: Mutex::new(()),
            wait_cond: Condvar::new(),
            acquired: Mutex::new(Vec::new()),
            pool: Mutex::new(HashMap::new()),
            obtained_total: AtomicU64::new(0),
            recycled_total: AtomicU64::new(0),
        }
    }

    /// Dense registry id of this transaction's owner thread.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// 1-based registration order, as used in `thread<N>.txt`.
    #[must_use]
    pub fn thread_number(&self) -> u32 {
        self.thread_number
    }

    pub(crate) fn conflict_lock(&self, order: Ordering) -> Option<RequestRef> {
        self.conflict.load(order)
    }

    pub(crate) fn set_conflict_lock(&self, handle: Option<RequestRef>, order: Ordering) {
        self.conflict.store(handle, order);
    }

    pub(crate) fn push_acquired(&self, handle: RequestRef) {
        self.acquired.lock().push(handle);
    }

    fn acquired_snapshot(&self) -> Vec<RequestRef> {
        self.acquired.lock().clone()
    }

    fn reset_for_begin(&self) {
        self.set_conflict_lock(None, Ordering::Release);
        self.acquired.lock().clear();
    }

    pub(crate) fn note_obtained(&self) {
        self.obtained_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_recycled(&self) {
        self.recycled_total.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// TxnRegistry
// ---------------------------------------------------------------------------

struct RegistryInner {
    by_thread: HashMap<ThreadId, OwnerId>,
    txns: Vec<Arc<Transaction>>,
}

/// Maps OS threads to their [`Transaction`] nodes.
///
/// Lookups take the shared lock; only first-time registration takes the
/// exclusive lock.
pub struct TxnRegistry {
    inner: RwLock<RegistryInner>,
}

impl TxnRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_thread: HashMap::new(),
                txns: Vec::new(),
            }),
        }
    }

    /// The calling thread's transaction, created on first use.
    pub fn current(&self) -> Arc<Transaction> {
        let tid = thread::current().id();
        {
            let inner = self.inner.read();
            if let Some(&owner) = inner.by_thread.get(&tid) {
                return Arc::clone(&inner.txns[owner.index()]);
            }
        }

        let mut inner = self.inner.write();
        if let Some(&owner) = inner.by_thread.get(&tid) {
            return Arc::clone(&inner.txns[owner.index()]);
        }
        let owner = OwnerId::new(inner.txns.len() as u32);
        let trx = Arc::new(Transaction::new(owner, owner.get() + 1));
        inner.by_thread.insert(tid, owner);
        inner.txns.push(Arc::clone(&trx));
        debug!(owner = %owner, thread_number = trx.thread_number(), "transaction registered");
        trx
    }

    /// Resolve an owner id to its transaction.
    pub(crate) fn by_owner(&self, owner: OwnerId) -> Arc<Transaction> {
        Arc::clone(&self.inner.read().txns[owner.index()])
    }

    fn snapshot(&self) -> Vec<Arc<Transaction>> {
        self.inner.read().txns.clone()
    }
}

impl Default for TxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RecycleMetrics
// ---------------------------------------------------------------------------

/// Aggregate lock-recycling counters across all registered transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecycleMetrics {
    /// Requests handed out (fresh or recycled).
    pub obtained_total: u64,
    /// Requests satisfied from a recycle pool.
    pub recycled_total: u64,
}

impl RecycleMetrics {
    /// Percentage of acquisitions served by recycling.
    #[must_use]
    pub fn recycled_pct(&self) -> f64 {
        if self.obtained_total == 0 {
            0.0
        } else {
            100.0 * self.recycled_total as f64 / self.obtained_total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

/// Drives transactions over a [`LockManager`].
pub struct TransactionManager {
    locks: LockManager,
    registry: Arc<TxnRegistry>,
    /// Commit ids handed out so far.
    execution_count: AtomicU64,
    /// The workload ends once a commit would draw past this id.
    last_commit_id: u64,
    log_dir: PathBuf,
}

impl TransactionManager {
    /// A manager over `record_count` records, committing at most
    /// `last_commit_id` transactions, writing `thread<N>.txt` logs under
    /// `log_dir`.
    #[must_use]
    pub fn new(
        record_count: u32,
        last_commit_id: u64,
        mode: TableMode,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        let registry = Arc::new(TxnRegistry::new());
        Self {
            locks: LockManager::new(record_count, mode, Arc::clone(&registry)),
            registry,
            execution_count: AtomicU64::new(0),
            last_commit_id,
            log_dir: log_dir.into(),
        }
    }

    /// The underlying lock manager.
    #[must_use]
    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Number of records in the table.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.locks.table().record_count()
    }

    /// Unlocked value peek, for post-run verification only.
    #[must_use]
    pub fn record_value(&self, id: RecordId) -> i64 {
        self.locks.record_value(id)
    }

    /// Start a fresh transaction on the calling thread.
    pub fn begin(&self) {
        self.registry.current().reset_for_begin();
    }

    /// Read a record under a shared lock.
    ///
    /// # Errors
    ///
    /// [`WaitlessError::Deadlock`] when queueing the lock would close a
    /// wait-for cycle; the caller must [`abort`](Self::abort).
    pub fn find(&self, record: RecordId) -> Result<i64> {
        let trx = self.registry.current();
        match self.locks.acquire(LockMode::Shared, record, &trx) {
            Some(handle) => Ok(self.locks.read_record(handle)),
            None => Err(WaitlessError::Deadlock {
                owner: trx.owner(),
                record,
            }),
        }
    }

    /// Add `diff` to a record under an exclusive lock, returning the new
    /// value.
    ///
    /// # Errors
    ///
    /// [`WaitlessError::Deadlock`] when queueing the lock would close a
    /// wait-for cycle; the caller must [`abort`](Self::abort).
    pub fn update(&self, record: RecordId, diff: i64) -> Result<i64> {
        let trx = self.registry.current();
        match self.locks.acquire(LockMode::Exclusive, record, &trx) {
            Some(handle) => {
                let value = self.locks.change_record(handle, diff);
                self.locks.arena().get(handle).set_diff(diff);
                Ok(value)
            }
            None => Err(WaitlessError::Deadlock {
                owner: trx.owner(),
                record,
            }),
        }
    }

    /// Undo every change of the running transaction and release its locks.
    pub fn abort(&self) {
        let trx = self.registry.current();
        for handle in trx.acquired_snapshot() {
            self.rollback_and_release(handle);
        }
    }

    /// Commit the running transaction.
    ///
    /// Returns `Ok(Some(commit_id))` on success, after appending the commit
    /// log line and releasing all locks. Returns `Ok(None)` when the drawn
    /// commit id exceeds the cap — the transaction is rolled back and the
    /// caller should treat the workload as finished.
    ///
    /// # Errors
    ///
    /// I/O failure while appending the commit log.
    pub fn commit(&self) -> Result<Option<u64>> {
        let trx = self.registry.current();
        let acquired = trx.acquired_snapshot();

        let commit_id = self.execution_count.fetch_add(1, Ordering::AcqRel) + 1;

        if commit_id > self.last_commit_id {
            debug!(commit_id, cap = self.last_commit_id, "commit cap reached; rolling back");
            for handle in acquired {
                self.rollback_and_release(handle);
            }
            return Ok(None);
        }

        let mut touched_ids = Vec::with_capacity(acquired.len());
        let mut touched_values = Vec::with_capacity(acquired.len());
        for handle in acquired {
            let request = self.locks.arena().get(handle);
            touched_ids.push(request.record_id());
            touched_values.push(self.locks.read_record(handle));
            self.locks.release(handle);
        }

        let mut line = commit_id.to_string();
        for id in &touched_ids {
            let _ = write!(line, " {id}");
        }
        for value in &touched_values {
            let _ = write!(line, " {value}");
        }
        line.push('\n');

        let path = self
            .log_dir
            .join(format!("thread{}.txt", trx.thread_number()));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        Ok(Some(commit_id))
    }

    /// Aggregate recycle counters across every registered transaction.
    #[must_use]
    pub fn recycle_metrics(&self) -> RecycleMetrics {
        let mut metrics = RecycleMetrics {
            obtained_total: 0,
            recycled_total: 0,
        };
        for trx in self.registry.snapshot() {
            metrics.obtained_total += trx.obtained_total.load(Ordering::Relaxed);
            metrics.recycled_total += trx.recycled_total.load(Ordering::Relaxed);
        }
        metrics
    }

    fn rollback_and_release(&self, handle: RequestRef) {
        let request = self.locks.arena().get(handle);
        if request.mode() == LockMode::Exclusive
            && request.state(Ordering::Acquire) != LockState::Obsolete
        {
            self.locks.change_record(handle, -request.diff());
        }
        self.locks.release(handle);
    }
}
