//! Wait-free atomic snapshot over single-writer multi-reader registers.
//!
//! The crate provides three layers, leaves first:
//!
//! - [`PackedRegister`]: a 64-bit cell packing a monotonically increasing
//!   timestamp with a 32-bit signed value, read and written as one atomic
//!   word so the pair is always mutually consistent.
//! - [`SnapshotHolder`]: a slot of N+1 snapshot buffers behind a single
//!   control word packing (outer refcount, current index). Readers
//!   [`acquire`](SnapshotHolder::acquire) the current buffer; the owning
//!   writer [`exchange`](SnapshotHolder::exchange)s in a fresh one and
//!   reconciles the split reference count lazily.
//! - [`AtomicSnapshot`]: the engine. [`scan`](AtomicSnapshot::scan) performs
//!   double collects until a clean pass, falling back to borrowing another
//!   writer's published snapshot once that writer has been observed to change
//!   twice; [`update`](AtomicSnapshot::update) publishes the caller's own
//!   snapshot before writing its register, which is what makes the borrow
//!   fallback sound.
//!
//! Every operation completes in a bounded number of its own steps regardless
//! of what other threads do.

pub mod engine;
pub mod holder;
pub mod register;

pub use engine::AtomicSnapshot;
pub use holder::{SnapshotGuard, SnapshotHolder};
pub use register::{PackedRegister, RegisterWord, Snapshot};
