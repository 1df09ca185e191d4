//! Versioned snapshot buffers behind a packed control word.
//!
//! Each writer owns one [`SnapshotHolder`] carrying N+1 buffers. The holder's
//! control word packs `(outer_refcount:u32, current_index:u32)` so a reader
//! can increment the refcount and learn which buffer it landed on in a single
//! `fetch_add` — that pairing is the whole point of the packing.
//!
//! ## The split counter
//!
//! The control word can only be incremented atomically; once the writer has
//! swung the index to a new buffer, readers of the old buffer have nothing to
//! decrement there. Instead a departing reader increments the buffer's own
//! signed *inner* count, and the writer's `exchange` subtracts the outer
//! count it received from the swap. The two sums reach zero exactly when the
//! last pre-swap reader has departed, at which moment the buffer is marked
//! recyclable. The inner count routinely goes negative in between.
//!
//! All buffer contents live in `AtomicU64` cells, so there is no `UnsafeCell`
//! and no `unsafe` anywhere in the protocol.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use tracing::trace;
use waitless_types::CacheAligned;

use crate::register::{RegisterWord, Snapshot};

/// Increment applied to the outer refcount half of the control word.
const OUTER_INC: u64 = 1 << 32;

/// Mask isolating the current-index half of the control word.
const INDEX_MASK: u64 = 0x0000_0000_ffff_ffff;

/// Split a raw control word into (outer refcount, buffer index).
#[inline]
const fn unpack_control(raw: u64) -> (u32, usize) {
    ((raw >> 32) as u32, (raw & INDEX_MASK) as usize)
}

// ---------------------------------------------------------------------------
// SnapshotBuffer
// ---------------------------------------------------------------------------

/// One version slot inside a [`SnapshotHolder`].
struct SnapshotBuffer {
    /// Packed register words, copied in by `exchange` and out by readers.
    cells: Box<[AtomicU64]>,
    /// Signed inner refcount; reconciled against the outer count (see module
    /// docs). Negative values are normal.
    inner_refs: AtomicI64,
    /// Set once no reader holds this buffer; cleared on reinstall.
    recyclable: AtomicBool,
}

impl SnapshotBuffer {
    fn new(cell_count: usize) -> Self {
        Self {
            cells: (0..cell_count).map(|_| AtomicU64::new(0)).collect(),
            inner_refs: AtomicI64::new(0),
            recyclable: AtomicBool::new(true),
        }
    }

    fn is_recyclable(&self) -> bool {
        self.recyclable.load(Ordering::Acquire)
    }

    /// Copy `snapshot` into the cells and arm the buffer for publication.
    ///
    /// Only called on a recyclable buffer, which holds no live readers.
    fn install(&self, snapshot: &Snapshot) {
        debug_assert_eq!(self.cells.len(), snapshot.len());
        for (cell, index) in self.cells.iter().zip(0..snapshot.len()) {
            cell.store(snapshot.word(index).raw(), Ordering::Release);
        }
        self.inner_refs.store(0, Ordering::Release);
        self.recyclable.store(false, Ordering::Release);
    }

    /// Copy the cells out into an owned snapshot.
    fn copy_out(&self) -> Snapshot {
        let words = self
            .cells
            .iter()
            .map(|cell| RegisterWord::from_raw(cell.load(Ordering::Acquire)))
            .collect();
        Snapshot::from_words(words)
    }

    /// A departing reader counts itself out.
    fn release(&self) {
        let remaining = self.inner_refs.fetch_add(1, Ordering::AcqRel) + 1;
        if remaining == 0 {
            self.recyclable.store(true, Ordering::Release);
        }
    }

    /// The writer subtracts the outer count captured at the index swap.
    fn reconcile(&self, outer: u32) {
        let remaining = self.inner_refs.fetch_sub(i64::from(outer), Ordering::AcqRel)
            - i64::from(outer);
        if remaining == 0 {
            self.recyclable.store(true, Ordering::Release);
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotHolder
// ---------------------------------------------------------------------------

/// A writer's published-snapshot slot: N+1 buffers plus the control word.
///
/// `acquire` is safe from any thread; `exchange` must only be called by the
/// owning writer.
pub struct SnapshotHolder {
    /// `(outer_refcount:u32, current_index:u32)`, alone on its cache line.
    control: CacheAligned<AtomicU64>,
    buffers: Box<[SnapshotBuffer]>,
}

impl SnapshotHolder {
    /// A holder for a register array of `writer_count` cells.
    ///
    /// Allocates `writer_count + 1` buffers: with at most `writer_count`
    /// in-flight acquirers, the writer always finds a recyclable buffer.
    #[must_use]
    pub fn new(writer_count: usize) -> Self {
        assert!(writer_count > 0, "snapshot holder needs at least one writer");
        Self {
            control: CacheAligned::new(AtomicU64::new(0)),
            buffers: (0..=writer_count)
                .map(|_| SnapshotBuffer::new(writer_count))
                .collect(),
        }
    }

    /// Number of version buffers (`writer_count + 1`).
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.buffers.len()
    }

    /// Pin the currently published buffer and return a reading guard.
    ///
    /// Wait-free: one `fetch_add` both counts the reader in and reports which
    /// buffer the count landed on. Dropping the guard counts the reader out.
    #[must_use]
    pub fn acquire(&self) -> SnapshotGuard<'_> {
        let raw = self.control.fetch_add(OUTER_INC, Ordering::AcqRel);
        let (_, index) = unpack_control(raw);
        SnapshotGuard {
            buffer: &self.buffers[index],
        }
    }

    /// Publish `snapshot` as the current version.
    ///
    /// Installs into a recyclable buffer, swaps the control word to point at
    /// it, and reconciles the displaced buffer's inner count with the outer
    /// count the swap reported.
    ///
    /// # Panics
    ///
    /// Panics if no buffer is recyclable, which cannot happen while the
    /// `writer_count + 1` sizing invariant holds.
    pub fn exchange(&self, snapshot: &Snapshot) {
        let target = self
            .buffers
            .iter()
            .position(SnapshotBuffer::is_recyclable)
            .expect("a snapshot holder with writer_count + 1 buffers always has a recyclable one");

        self.buffers[target].install(snapshot);

        let old_raw = self.control.swap(target as u64, Ordering::AcqRel);
        let (old_outer, old_index) = unpack_control(old_raw);

        if old_index != target {
            trace!(old_index, new_index = target, old_outer, "snapshot version swapped");
            self.buffers[old_index].reconcile(old_outer);
        }
    }
}

/// RAII pin on one published snapshot buffer.
///
/// Obtained from [`SnapshotHolder::acquire`]; releases the buffer on drop.
pub struct SnapshotGuard<'a> {
    buffer: &'a SnapshotBuffer,
}

impl SnapshotGuard<'_> {
    /// Copy the pinned buffer out into an owned snapshot.
    #[must_use]
    pub fn to_snapshot(&self) -> Snapshot {
        self.buffer.copy_out()
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterWord;

    fn snapshot_of(values: &[i32]) -> Snapshot {
        Snapshot::from_words(
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| RegisterWord::pack(i as u32 + 1, v))
                .collect(),
        )
    }

    #[test]
    fn acquire_before_first_publish_sees_zeroes() {
        let holder = SnapshotHolder::new(2);
        let guard = holder.acquire();
        let snap = guard.to_snapshot();
        assert_eq!(snap.values().collect::<Vec<_>>(), vec![0, 0]);
    }

    #[test]
    fn exchange_then_acquire_roundtrips() {
        let holder = SnapshotHolder::new(3);
        holder.exchange(&snapshot_of(&[1, 2, 3]));
        let guard = holder.acquire();
        assert_eq!(guard.to_snapshot().values().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn version_count_is_writer_count_plus_one() {
        assert_eq!(SnapshotHolder::new(4).version_count(), 5);
    }

    #[test]
    fn held_buffer_is_not_reused_until_released() {
        let holder = SnapshotHolder::new(2);
        holder.exchange(&snapshot_of(&[10, 11]));

        // Pin the published version, then publish twice more. The pinned
        // buffer must keep its contents through both exchanges.
        let guard = holder.acquire();
        holder.exchange(&snapshot_of(&[20, 21]));
        holder.exchange(&snapshot_of(&[30, 31]));
        assert_eq!(guard.to_snapshot().values().collect::<Vec<_>>(), vec![10, 11]);
        drop(guard);

        let guard = holder.acquire();
        assert_eq!(guard.to_snapshot().values().collect::<Vec<_>>(), vec![30, 31]);
    }

    #[test]
    fn release_after_swap_marks_buffer_recyclable() {
        let holder = SnapshotHolder::new(1);
        holder.exchange(&snapshot_of(&[7]));

        let guard = holder.acquire();
        holder.exchange(&snapshot_of(&[8]));

        // The displaced buffer still counts one reader; exchange reconciled
        // outer=1 against inner=0, so only the drop below zeroes the sum.
        drop(guard);

        // Both exchanges below must find recyclable buffers again.
        holder.exchange(&snapshot_of(&[9]));
        holder.exchange(&snapshot_of(&[10]));
        let guard = holder.acquire();
        assert_eq!(guard.to_snapshot().value(0), 10);
    }
}
