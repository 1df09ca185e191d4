//! Per-record lock queue anchors.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use waitless_types::{CacheAligned, RecordId};

use crate::request::AtomicRequestRef;

/// Every record starts at this value.
pub const INITIAL_RECORD_VALUE: i64 = 100;

/// One record: its value plus the anchors of its FIFO lock queue.
///
/// `head` and `tail` sit on distinct cache lines: inserters hammer the tail
/// while releasers walk the head. The queue between them is FIFO by logical
/// lock id; `head` never moves past a non-obsolete node, and everything
/// strictly behind `head` is obsolete.
pub struct LockRecord {
    record_id: RecordId,
    /// Mutated only under an exclusive request on this record.
    value: AtomicI64,
    /// Oldest possibly-live request. Serialization of forward movement is the
    /// `head_mutex`'s job; inserters only publish the very first head.
    pub(crate) head: CacheAligned<AtomicRequestRef>,
    /// Insertion point; newcomers exchange themselves in.
    pub(crate) tail: CacheAligned<AtomicRequestRef>,
    /// Serializes head advancement among releasers on this record. Inserters
    /// and queue walkers never take it.
    pub(crate) head_mutex: Mutex<()>,
}

impl LockRecord {
    fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            value: AtomicI64::new(INITIAL_RECORD_VALUE),
            head: CacheAligned::new(AtomicRequestRef::none()),
            tail: CacheAligned::new(AtomicRequestRef::none()),
            head_mutex: Mutex::new(()),
        }
    }

    /// The record's 1-based id.
    #[inline]
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    /// Current value.
    ///
    /// Meaningful to a caller holding a request on this record; unlocked
    /// reads are only for post-run verification.
    #[inline]
    #[must_use]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Apply `diff` and return the new value. Caller holds an exclusive
    /// request on this record.
    #[inline]
    pub(crate) fn apply_diff(&self, diff: i64) -> i64 {
        self.value.fetch_add(diff, Ordering::AcqRel) + diff
    }
}

/// The record table: a flat vector indexed by 1-based record id.
pub struct LockTable {
    records: Vec<LockRecord>,
}

impl LockTable {
    /// A table of `record_count` records with ids `1..=record_count`.
    #[must_use]
    pub fn new(record_count: u32) -> Self {
        Self {
            records: (1..=record_count).map(|id| LockRecord::new(RecordId::new(id))).collect(),
        }
    }

    /// Number of records.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Resolve a record id.
    ///
    /// # Panics
    ///
    /// Panics when `id` is out of range.
    #[inline]
    #[must_use]
    pub fn record(&self, id: RecordId) -> &LockRecord {
        &self.records[id.index()]
    }

    /// Iterate all records in id order.
    pub fn records(&self) -> impl Iterator<Item = &LockRecord> {
        self.records.iter()
    }
}
