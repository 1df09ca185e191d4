//! Lock request nodes and the arena that owns them.
//!
//! Queue links are [`RequestRef`] handles — indices into a grow-only
//! [`RequestArena`] — rather than raw pointers. Nodes are never deallocated,
//! so a handle read from a queue always refers to a live node; whether that
//! node still means what the reader expects is governed by the recycling
//! protocol below.
//!
//! ## Recycling
//!
//! A thread reuses its own requests instead of allocating per acquisition.
//! Three conditions together prove a node is unreachable from any live queue
//! traversal and may be reinitialized:
//!
//! 1. `state == Obsolete` — the node was logically removed.
//! 2. `id_passed` — the node handed its logical id to its successor, so the
//!    successor no longer spins on it.
//! 3. `head_passed` — the record's head moved past the node, so no head-rooted
//!    walk can start from it.
//!
//! The reference global-mutex table mode skips logical ids entirely and only
//! needs conditions 1 and 3.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};

use waitless_types::{OwnerId, RecordId};

/// Sentinel for a lock id that has not been assigned yet.
pub const LOCK_ID_UNSET: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Mode / state
// ---------------------------------------------------------------------------

/// Lock compatibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers; compatible with other shared requests.
    Shared,
    /// Writers; incompatible with everything.
    Exclusive,
}

impl LockMode {
    /// Whether two requests in these modes may hold the record together.
    #[inline]
    #[must_use]
    pub fn is_compatible_with(self, other: Self) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Shared => 0,
            Self::Exclusive => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Shared,
            1 => Self::Exclusive,
            _ => unreachable!("corrupt lock mode encoding"),
        }
    }
}

/// Lifecycle state of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Granted, or still running its compatibility scan.
    Active,
    /// Blocked on an incompatible predecessor.
    Wait,
    /// Logically removed; physically reusable once the recycle conditions
    /// hold.
    Obsolete,
}

impl LockState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Wait => 1,
            Self::Obsolete => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Wait,
            2 => Self::Obsolete,
            _ => unreachable!("corrupt lock state encoding"),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestRef
// ---------------------------------------------------------------------------

/// Stable handle to a [`LockRequest`] in a [`RequestArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestRef(u32);

impl RequestRef {
    const NONE_BITS: u32 = u32::MAX;

    #[inline]
    fn from_bits(bits: u32) -> Option<Self> {
        (bits != Self::NONE_BITS).then_some(Self(bits))
    }

    #[inline]
    fn to_bits(handle: Option<Self>) -> u32 {
        handle.map_or(Self::NONE_BITS, |r| r.0)
    }
}

impl std::fmt::Debug for RequestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// An atomic cell holding an optional [`RequestRef`].
///
/// Used for queue links (`next`, `head`, `tail`) and conflict pointers.
#[derive(Debug)]
pub(crate) struct AtomicRequestRef(AtomicU32);

impl AtomicRequestRef {
    pub(crate) const fn none() -> Self {
        Self(AtomicU32::new(RequestRef::NONE_BITS))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Option<RequestRef> {
        RequestRef::from_bits(self.0.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, handle: Option<RequestRef>, order: Ordering) {
        self.0.store(RequestRef::to_bits(handle), order);
    }

    #[inline]
    pub(crate) fn swap(&self, handle: Option<RequestRef>, order: Ordering) -> Option<RequestRef> {
        RequestRef::from_bits(self.0.swap(RequestRef::to_bits(handle), order))
    }
}

// ---------------------------------------------------------------------------
// LockRequest
// ---------------------------------------------------------------------------

/// One node in a record's lock queue.
///
/// Every field is atomic: the node outlives any single acquisition and may be
/// reinitialized by its owner while other threads still hold (stale) handles
/// to it. The recycling conditions guarantee those stale handles are never
/// dereferenced in a way that observes the reinitialization as corruption.
pub struct LockRequest {
    record_id: AtomicU32,
    owner: AtomicU32,
    mode: AtomicU8,
    state: AtomicU8,
    /// Logical position in the record's queue; [`LOCK_ID_UNSET`] until the
    /// predecessor's id is known.
    lock_id: AtomicU64,
    pub(crate) next: AtomicRequestRef,
    /// Delta applied by an exclusive holder, kept for rollback.
    diff: AtomicI64,
    id_passed: AtomicBool,
    head_passed: AtomicBool,
    signaled: AtomicBool,
}

impl LockRequest {
    /// An uninitialized node, as constructed inside a fresh arena chunk.
    fn vacant() -> Self {
        Self {
            record_id: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            mode: AtomicU8::new(LockMode::Shared.as_u8()),
            state: AtomicU8::new(LockState::Obsolete.as_u8()),
            lock_id: AtomicU64::new(LOCK_ID_UNSET),
            next: AtomicRequestRef::none(),
            diff: AtomicI64::new(0),
            id_passed: AtomicBool::new(false),
            head_passed: AtomicBool::new(false),
            signaled: AtomicBool::new(false),
        }
    }

    /// Reinitialize for a new acquisition.
    ///
    /// The node is unreachable at this point (fresh from the arena, or its
    /// recycle conditions held), so plain Relaxed stores suffice; the tail
    /// exchange that links the node publishes them.
    pub(crate) fn prepare(&self, record: RecordId, owner: OwnerId, mode: LockMode) {
        self.record_id.store(record.get(), Ordering::Relaxed);
        self.owner.store(owner.get(), Ordering::Relaxed);
        self.mode.store(mode.as_u8(), Ordering::Relaxed);
        self.state.store(LockState::Active.as_u8(), Ordering::Relaxed);
        self.lock_id.store(LOCK_ID_UNSET, Ordering::Relaxed);
        self.next.store(None, Ordering::Relaxed);
        self.diff.store(0, Ordering::Relaxed);
        self.id_passed.store(false, Ordering::Relaxed);
        self.head_passed.store(false, Ordering::Relaxed);
        self.signaled.store(false, Ordering::Relaxed);
    }

    /// Record this request locks (1-based).
    #[inline]
    #[must_use]
    pub fn record_id(&self) -> RecordId {
        RecordId::new(self.record_id.load(Ordering::Relaxed))
    }

    /// Owner that queued this request.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        OwnerId::new(self.owner.load(Ordering::Relaxed))
    }

    /// Compatibility mode of this request.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> LockMode {
        LockMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn state(&self, order: Ordering) -> LockState {
        LockState::from_u8(self.state.load(order))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: LockState, order: Ordering) {
        self.state.store(state.as_u8(), order);
    }

    #[inline]
    pub(crate) fn lock_id(&self, order: Ordering) -> u64 {
        self.lock_id.load(order)
    }

    #[inline]
    pub(crate) fn set_lock_id(&self, id: u64, order: Ordering) {
        self.lock_id.store(id, order);
    }

    #[inline]
    pub(crate) fn diff(&self) -> i64 {
        self.diff.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_diff(&self, diff: i64) {
        self.diff.store(diff, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn id_passed(&self, order: Ordering) -> bool {
        self.id_passed.load(order)
    }

    #[inline]
    pub(crate) fn set_id_passed(&self, order: Ordering) {
        self.id_passed.store(true, order);
    }

    #[inline]
    pub(crate) fn head_passed(&self, order: Ordering) -> bool {
        self.head_passed.load(order)
    }

    #[inline]
    pub(crate) fn set_head_passed(&self, order: Ordering) {
        self.head_passed.store(true, order);
    }

    #[inline]
    pub(crate) fn signaled(&self, order: Ordering) -> bool {
        self.signaled.load(order)
    }

    #[inline]
    pub(crate) fn set_signaled(&self, order: Ordering) {
        self.signaled.store(true, order);
    }

    /// Whether the owner may reinitialize this node.
    ///
    /// `needs_id_pass` is true in the lock-free table mode, where successors
    /// spin on the predecessor's id.
    #[must_use]
    pub(crate) fn can_recycle(&self, needs_id_pass: bool) -> bool {
        self.state(Ordering::Acquire) == LockState::Obsolete
            && self.head_passed(Ordering::Acquire)
            && (!needs_id_pass || self.id_passed(Ordering::Acquire))
    }
}

// ---------------------------------------------------------------------------
// RequestArena
// ---------------------------------------------------------------------------

/// log2 of the nodes per chunk.
const CHUNK_BITS: usize = 10;

/// Nodes per chunk.
const CHUNK_LEN: usize = 1 << CHUNK_BITS;

/// Upper bound on chunks (≈ 4.2M requests). Recycling keeps real workloads
/// far below this; hitting it means requests are leaking.
const MAX_CHUNKS: usize = 4096;

/// Grow-only arena of [`LockRequest`] nodes with stable addresses.
///
/// Allocation bumps a counter and lazily materializes 1024-node chunks;
/// lookup by [`RequestRef`] is lock-free. Nodes are never freed — reuse goes
/// through the owners' recycle pools.
pub struct RequestArena {
    chunks: Box<[OnceLock<Box<[LockRequest]>>]>,
    len: AtomicU32,
}

impl RequestArena {
    /// An empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            len: AtomicU32::new(0),
        }
    }

    /// Allocate a node initialized for `(record, owner, mode)`.
    ///
    /// # Panics
    ///
    /// Panics when the arena capacity is exhausted.
    pub fn alloc(&self, record: RecordId, owner: OwnerId, mode: LockMode) -> RequestRef {
        let slot = self.len.fetch_add(1, Ordering::Relaxed);
        assert!(
            (slot as usize) < MAX_CHUNKS * CHUNK_LEN,
            "lock request arena exhausted; requests are not being recycled"
        );
        let request = self.request_at(slot);
        request.prepare(record, owner, mode);
        RequestRef(slot)
    }

    /// Resolve a handle to its node.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: RequestRef) -> &LockRequest {
        self.request_at(handle.0)
    }

    /// Total nodes ever allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    /// Whether no node was ever allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn request_at(&self, slot: u32) -> &LockRequest {
        let chunk = self.chunks[(slot as usize) >> CHUNK_BITS]
            .get_or_init(|| (0..CHUNK_LEN).map(|_| LockRequest::vacant()).collect());
        &chunk[(slot as usize) & (CHUNK_LEN - 1)]
    }
}

impl Default for RequestArena {
    fn default() -> Self {
        Self::new()
    }
}
