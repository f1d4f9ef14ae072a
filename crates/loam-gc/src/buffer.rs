//! Allocation points.
//!
//! An allocation point (AP) is a per-mutator bump window into one segment
//! of a pool. The fast path runs without the arena lock: `reserve` bumps
//! the window, the client initializes the object, and `commit` publishes
//! it. A collection flip between reserve and commit *trips* the point:
//! commit fails, and the client must re-reserve and re-initialize.
//!
//! Invariant while attached: `seg.base <= base <= init <= alloc <= limit
//! <= seg.limit`. The covered range is buffered and exempt from collection
//! treatment until the point detaches.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::arena::{Arena, ArenaInner};
use crate::arith::{self, Addr};
use crate::error::{GcError, Result};
use crate::pool::{self, PoolClassId, PoolId};
use crate::seg::{Rank, SegId};
use crate::zone::ZoneSet;

/// Index of an allocation point within the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ApId(pub(crate) u32);

/// An opaque marker bounding a stack-like allocation scope.
///
/// The distinguished bottom-of-stack marker is produced by pushing on an
/// empty buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMarker(pub(crate) Option<Addr>);

/// Allocation patterns a client can declare on a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPattern {
    /// A burst of allocation that will mostly die together; condemnation of
    /// the point's generation is deferred while the pattern is active.
    Ramp,
}

/// The bump window shared between the mutator fast path and the collector.
pub(crate) struct ApShared {
    pub(crate) base: AtomicUsize,
    pub(crate) init: AtomicUsize,
    pub(crate) alloc: AtomicUsize,
    pub(crate) limit: AtomicUsize,
    /// Set by a flip; makes the in-flight commit fail.
    pub(crate) trapped: AtomicBool,
}

impl ApShared {
    fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            init: AtomicUsize::new(0),
            alloc: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            trapped: AtomicBool::new(false),
        }
    }

    pub(crate) fn init_addr(&self) -> Addr {
        self.init.load(Ordering::Acquire)
    }

    pub(crate) fn limit_addr(&self) -> Addr {
        self.limit.load(Ordering::Acquire)
    }
}

/// Arena-side record of an allocation point.
pub(crate) struct Ap {
    pub(crate) pool: PoolId,
    pub(crate) rank: Rank,
    pub(crate) seg: Option<SegId>,
    pub(crate) base: Addr,
    /// Real limit while the shared limit is zeroed by a flip trap.
    pub(crate) saved_limit: Addr,
    /// Top of the SNC segment chain (the attached segment plus the chain
    /// threaded through segment payloads).
    pub(crate) snc_chain: Option<SegId>,
    pub(crate) pattern_depth: u32,
    pub(crate) shared: Arc<ApShared>,
}

impl Ap {
    pub(crate) fn new(pool: PoolId, rank: Rank) -> Self {
        Self {
            pool,
            rank,
            seg: None,
            base: 0,
            saved_limit: 0,
            snc_chain: None,
            pattern_depth: 0,
            shared: Arc::new(ApShared::new()),
        }
    }
}

/// Attach an allocation point to `[base, limit)` of `sid`.
///
/// The segment's summary becomes universal: the mutator is about to write
/// references through the window without a barrier.
pub(crate) fn attach(inner: &mut ArenaInner, ap_id: ApId, sid: SegId, base: Addr, limit: Addr) {
    {
        let ap = inner.ap_mut(ap_id);
        ap.seg = Some(sid);
        ap.base = base;
        ap.saved_limit = limit;
        let shared = &ap.shared;
        shared.base.store(base, Ordering::Relaxed);
        shared.init.store(base, Ordering::Relaxed);
        shared.alloc.store(base, Ordering::Relaxed);
        shared.trapped.store(false, Ordering::Relaxed);
        shared.limit.store(limit, Ordering::Release);
    }
    inner.seg_mut(sid).buffer = Some(ap_id);
    crate::seg::set_summary(inner, sid, ZoneSet::UNIV);
}

/// Detach the point from its segment, returning `(seg, base, init, limit)`
/// of the formerly buffered range. The class `buffer_empty` does the
/// accounting with these.
pub(crate) fn take_range(inner: &mut ArenaInner, ap_id: ApId) -> (SegId, Addr, Addr, Addr) {
    let (sid, base, init, limit) = {
        let ap = inner.ap_mut(ap_id);
        let sid = ap.seg.take().expect("allocation point not attached");
        let shared = &ap.shared;
        let init = shared.init.load(Ordering::Acquire);
        let limit = if shared.limit.load(Ordering::Acquire) == 0 {
            ap.saved_limit
        } else {
            shared.limit.load(Ordering::Acquire)
        };
        shared.base.store(0, Ordering::Relaxed);
        shared.init.store(0, Ordering::Relaxed);
        shared.alloc.store(0, Ordering::Relaxed);
        shared.limit.store(0, Ordering::Release);
        shared.trapped.store(false, Ordering::Relaxed);
        (sid, ap.base, init, limit)
    };
    inner.seg_mut(sid).buffer = None;
    (sid, base, init, limit)
}

/// Trip every attached allocation point at a flip.
///
/// Zeroing the shared limit makes the in-flight reserve/commit pair fail;
/// the saved limit is restored when the mutator takes the trip path.
pub(crate) fn flip_all(inner: &mut ArenaInner) {
    for id in inner.aps.ids().collect::<Vec<_>>() {
        let ap = inner.aps.get_mut(id).expect("ap just listed");
        if ap.seg.is_none() {
            continue;
        }
        let limit = ap.shared.limit.swap(0, Ordering::AcqRel);
        if limit != 0 {
            ap.saved_limit = limit;
        }
        ap.shared.trapped.store(true, Ordering::Release);
    }
}

/// The buffered scan limit of a segment: committed objects end here.
pub(crate) fn scan_limit(inner: &ArenaInner, sid: SegId) -> Addr {
    match inner.seg(sid).buffer {
        Some(ap_id) => inner.ap(ap_id).shared.init_addr(),
        None => inner.seg(sid).limit,
    }
}

/// The buffer limit of a segment, or its own limit when unbuffered.
pub(crate) fn buffer_limit(inner: &ArenaInner, sid: SegId) -> Addr {
    match inner.seg(sid).buffer {
        Some(ap_id) => {
            let ap = inner.ap(ap_id);
            let limit = ap.shared.limit_addr();
            if limit == 0 {
                ap.saved_limit
            } else {
                limit
            }
        }
        None => inner.seg(sid).limit,
    }
}

/// A per-mutator allocation point into one pool.
///
/// Dropping the point detaches it and returns the unused region.
pub struct AllocPoint {
    arena: Arc<Arena>,
    id: ApId,
    align: usize,
    shared: Arc<ApShared>,
}

impl AllocPoint {
    /// Create an allocation point on a pool of `arena`, allocating at
    /// `rank`.
    ///
    /// # Errors
    ///
    /// `Param` for a stale pool or a rank the pool class does not allocate
    /// at: AMS allocates exact, AWL exact or weak, SNC exact or ambiguous.
    pub fn create(arena: &Arc<Arena>, pid: PoolId, rank: Rank) -> Result<Self> {
        arena.enter(|inner| {
            if !inner.pools.contains(pid.0) {
                return Err(GcError::Param);
            }
            let ok = match inner.pool(pid).class_id() {
                PoolClassId::Ams => rank == Rank::Exact,
                PoolClassId::Awl => rank == Rank::Exact || rank == Rank::Weak,
                PoolClassId::Snc => rank == Rank::Exact || rank == Rank::Ambig,
            };
            if !ok {
                return Err(GcError::Param);
            }
            let align = inner.pool(pid).align;
            let ap = Ap::new(pid, rank);
            let shared = Arc::clone(&ap.shared);
            let id = ApId(inner.aps.insert(ap));
            Ok(Self {
                arena: Arc::clone(arena),
                id,
                align,
                shared,
            })
        })
    }

    /// Reserve `size` bytes, returning the base of the reserved region.
    ///
    /// The client must initialize the region and then call [`commit`]. The
    /// size is rounded up to the pool alignment.
    ///
    /// # Errors
    ///
    /// `Param` for a zero size; `Memory`/`Resource` when the pool cannot
    /// refill the point.
    ///
    /// [`commit`]: Self::commit
    pub fn reserve(&mut self, size: usize) -> Result<Addr> {
        if size == 0 {
            return Err(GcError::Param);
        }
        let size = arith::align_up(size, self.align);
        let alloc = self.shared.alloc.load(Ordering::Relaxed);
        let limit = self.shared.limit.load(Ordering::Acquire);
        if alloc != 0 && alloc + size <= limit {
            self.shared.alloc.store(alloc + size, Ordering::Relaxed);
            return Ok(alloc);
        }
        self.arena.enter(|inner| {
            let base = pool::buffer_fill(inner, self.id, size)?;
            let ap = inner.ap(self.id);
            ap.shared.alloc.store(base + size, Ordering::Relaxed);
            crate::arena::poll(inner);
            Ok(base)
        })
    }

    /// Publish the object at `[base, base + size)`.
    ///
    /// Returns `false` if a flip intervened since the matching [`reserve`];
    /// the object is then dead and must be re-reserved and re-initialized.
    ///
    /// [`reserve`]: Self::reserve
    pub fn commit(&mut self, base: Addr, size: usize) -> bool {
        let size = arith::align_up(size, self.align);
        let alloc = self.shared.alloc.load(Ordering::Relaxed);
        debug_assert_eq!(base + size, alloc, "commit does not match reserve");
        self.shared.init.store(alloc, Ordering::Release);
        if self.shared.limit.load(Ordering::Acquire) == 0 {
            self.trip(base)
        } else {
            true
        }
    }

    /// Slow path after a flip zeroed the limit.
    fn trip(&mut self, base: Addr) -> bool {
        self.arena.enter(|inner| {
            let ap = inner.ap_mut(self.id);
            if ap.shared.trapped.swap(false, Ordering::AcqRel) {
                // The flip happened between reserve and commit: the object
                // was condemned uninitialized. Roll the window back.
                ap.shared.alloc.store(base, Ordering::Relaxed);
                ap.shared.init.store(base, Ordering::Relaxed);
                ap.shared.limit.store(ap.saved_limit, Ordering::Release);
                false
            } else {
                // Detached point; the commit stands once re-attached.
                true
            }
        })
    }

    /// Begin an allocation pattern.
    ///
    /// # Errors
    ///
    /// Currently infallible for the supported patterns; reserved for
    /// pattern kinds a pool class may decline.
    pub fn pattern_begin(&mut self, pattern: AllocPattern) -> Result<()> {
        let AllocPattern::Ramp = pattern;
        self.arena.enter(|inner| {
            let pid = inner.ap(self.id).pool;
            inner.ap_mut(self.id).pattern_depth += 1;
            inner.pool_mut(pid).gen.ramp_depth += 1;
            Ok(())
        })
    }

    /// End an allocation pattern. Unbalanced ends are a parameter error.
    ///
    /// # Errors
    ///
    /// `Param` if no pattern is active.
    pub fn pattern_end(&mut self, pattern: AllocPattern) -> Result<()> {
        let AllocPattern::Ramp = pattern;
        self.arena.enter(|inner| {
            if inner.ap(self.id).pattern_depth == 0 {
                return Err(GcError::Param);
            }
            let pid = inner.ap(self.id).pool;
            inner.ap_mut(self.id).pattern_depth -= 1;
            inner.pool_mut(pid).gen.ramp_depth -= 1;
            Ok(())
        })
    }

    /// Push a lightweight allocation frame at the current initialized point.
    ///
    /// # Errors
    ///
    /// `Unimpl` unless the pool class supports frames.
    pub fn frame_push(&mut self) -> Result<FrameMarker> {
        self.arena
            .enter(|inner| pool::frame_push(inner, self.id))
            .map(FrameMarker)
    }

    /// Pop back to `frame`, discarding every object allocated above it.
    ///
    /// # Errors
    ///
    /// `Unimpl` unless the pool class supports frames; `Param` for a marker
    /// that does not lie in this point's chain.
    pub fn frame_pop(&mut self, frame: FrameMarker) -> Result<()> {
        self.arena
            .enter(|inner| pool::frame_pop(inner, self.id, frame.0))
    }

    /// The rank this point allocates at.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.arena.enter(|inner| inner.ap(self.id).rank)
    }
}

impl Drop for AllocPoint {
    fn drop(&mut self) {
        self.arena.enter(|inner| {
            if !inner.aps.contains(self.id.0) {
                return;
            }
            let pid = inner.ap(self.id).pool;
            // The pool may already be gone if the point outlived it.
            if inner.pools.contains(pid.0) {
                pool::buffer_empty(inner, self.id);
                let depth = inner.ap(self.id).pattern_depth;
                inner.pool_mut(pid).gen.ramp_depth -= depth;
                // An SNC point frees its whole chain on destruction.
                let _ = pool::frame_pop(inner, self.id, None);
            }
            inner.aps.remove(self.id.0);
        });
    }
}
