//! Pools and the pool-class framework.
//!
//! A pool owns a set of segments and governs them with one collection
//! policy. The classic design expresses pool classes as a vtable hierarchy;
//! here the class set is closed, so dispatch is an enum and a `match`, with
//! per-class state held in the enum arm and per-segment state in the
//! segment payload.
//!
//! Operations a class does not support return [`GcError::Unimpl`]; segment
//! operations a class does not specialize fall back to shared defaults.

pub(crate) mod ams;
pub(crate) mod awl;
pub(crate) mod snc;

use crate::arena::ArenaInner;
use crate::arith::Addr;
use crate::buffer::ApId;
use crate::error::{GcError, Result};
use crate::format::Format;
use crate::seg::{self, SegId};
use crate::trace::{ScanState, TraceId, TraceSet};

pub use ams::{AmsOptions, DebugOptions};
pub use awl::{AwlOptions, FindDependentFn};
pub use snc::SncOptions;

/// Handle for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolId(pub(crate) u32);

/// Handle for a generation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainId(pub(crate) u32);

/// Identity of a pool class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClassId {
    /// Automatic mark-and-sweep.
    Ams,
    /// Automatic weak-linked (mark-and-sweep with weak rank).
    Awl,
    /// Stack-no-check: stack-ordered allocation frames, never collected.
    Snc,
}

/// Configuration of one generation in a chain.
#[derive(Debug, Clone, Copy)]
pub struct GenParams {
    /// Bytes of new allocation that trigger condemnation of the generation.
    pub capacity: usize,
    /// Predicted fraction of condemned storage that dies.
    pub mortality: f64,
}

pub(crate) struct GenDesc {
    pub(crate) capacity: usize,
    pub(crate) mortality: f64,
}

pub(crate) struct Chain {
    pub(crate) gens: Vec<GenDesc>,
}

/// Per-pool generation accounting.
///
/// Invariant: `total = free + buffered + new + old` (all in bytes).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolGen {
    pub(crate) chain: Option<(ChainId, usize)>,
    pub(crate) total_size: usize,
    pub(crate) free_size: usize,
    pub(crate) buffered_size: usize,
    pub(crate) new_size: usize,
    pub(crate) old_size: usize,
    /// Active ramp-pattern nesting across this pool's allocation points.
    pub(crate) ramp_depth: u32,
}

impl PoolGen {
    pub(crate) fn account_seg_create(&mut self, size: usize) {
        self.total_size += size;
        self.free_size += size;
    }

    pub(crate) fn account_seg_free(&mut self, size: usize) {
        debug_assert!(self.free_size >= size);
        self.total_size -= size;
        self.free_size -= size;
    }

    pub(crate) fn account_fill(&mut self, size: usize) {
        debug_assert!(self.free_size >= size);
        self.free_size -= size;
        self.buffered_size += size;
    }

    pub(crate) fn account_empty(&mut self, used: usize, unused: usize) {
        debug_assert!(self.buffered_size >= used + unused);
        self.buffered_size -= used + unused;
        self.new_size += used;
        self.free_size += unused;
        self.check();
    }

    pub(crate) fn account_age(&mut self, aged_buffered: usize, aged_new: usize) {
        debug_assert!(self.buffered_size >= aged_buffered);
        debug_assert!(self.new_size >= aged_new);
        self.buffered_size -= aged_buffered;
        self.new_size -= aged_new;
        self.old_size += aged_buffered + aged_new;
        self.check();
    }

    pub(crate) fn account_reclaim(&mut self, size: usize) {
        debug_assert!(self.old_size >= size);
        self.old_size -= size;
        self.free_size += size;
        self.check();
    }

    fn check(&self) {
        debug_assert_eq!(
            self.total_size,
            self.free_size + self.buffered_size + self.new_size + self.old_size
        );
    }
}

/// Per-class pool state.
pub(crate) enum PoolClass {
    Ams(ams::AmsPool),
    Awl(awl::AwlPool),
    Snc(snc::SncPool),
}

pub(crate) struct Pool {
    pub(crate) class: PoolClass,
    pub(crate) format: Format,
    /// Pool alignment: the grain size of this pool's segments.
    pub(crate) align: usize,
    pub(crate) align_shift: u32,
    /// Preferred segment size for buffer refills.
    pub(crate) extend_by: usize,
    pub(crate) segs: Vec<SegId>,
    pub(crate) gen: PoolGen,
}

impl Pool {
    pub(crate) fn class_id(&self) -> PoolClassId {
        match self.class {
            PoolClass::Ams(_) => PoolClassId::Ams,
            PoolClass::Awl(_) => PoolClassId::Awl,
            PoolClass::Snc(_) => PoolClassId::Snc,
        }
    }

    /// Whether the collector may condemn and reclaim this pool's storage.
    pub(crate) fn is_collectible(&self) -> bool {
        !matches!(self.class, PoolClass::Snc(_))
    }

    #[inline]
    pub(crate) fn grains(&self, bytes: usize) -> usize {
        bytes >> self.align_shift
    }

    #[inline]
    pub(crate) fn grains_size(&self, grains: usize) -> usize {
        grains << self.align_shift
    }

    #[inline]
    pub(crate) fn index_of_addr(&self, seg_base: Addr, addr: Addr) -> usize {
        debug_assert!(addr >= seg_base);
        (addr - seg_base) >> self.align_shift
    }

    #[inline]
    pub(crate) fn addr_of_index(&self, seg_base: Addr, index: usize) -> Addr {
        seg_base + (index << self.align_shift)
    }

    /// Total arena storage owned by the pool.
    pub(crate) fn total_size(&self) -> usize {
        self.gen.total_size
    }

    /// Storage not handed out to the client.
    pub(crate) fn free_size(&self) -> usize {
        self.gen.free_size
    }
}

fn class_of(inner: &ArenaInner, sid: SegId) -> PoolClassId {
    let pid = inner.seg(sid).pool;
    inner.pool(pid).class_id()
}

/// Condemn the segment for a trace (the class `whiten` operation).
pub(crate) fn seg_whiten(inner: &mut ArenaInner, sid: SegId, trace: TraceId) -> Result<()> {
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::seg_whiten(inner, sid, trace),
        PoolClassId::Awl => awl::seg_whiten(inner, sid, trace),
        // SNC storage is never condemned.
        PoolClassId::Snc => Ok(()),
    }
}

/// Make the segment grey for a trace (the class `grey` operation).
pub(crate) fn seg_greyen(inner: &mut ArenaInner, sid: SegId, trace: TraceId) {
    match class_of(inner, sid) {
        PoolClassId::Awl => awl::seg_greyen(inner, sid, trace),
        PoolClassId::Ams | PoolClassId::Snc => {
            if !inner.seg(sid).white.contains(trace) {
                seg::greyen(inner, sid, trace);
            }
        }
    }
}

/// Turn grey objects black without scanning (the class `blacken` operation).
pub(crate) fn seg_blacken(inner: &mut ArenaInner, sid: SegId, traces: TraceSet) {
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::seg_blacken(inner, sid, traces),
        PoolClassId::Awl => awl::seg_blacken(inner, sid, traces),
        PoolClassId::Snc => {}
    }
    let grey = inner.seg(sid).grey.diff(traces);
    seg::set_grey(inner, sid, grey);
}

/// Scan the segment's grey objects. Returns whether every reference in the
/// segment was scanned (`total`).
pub(crate) fn seg_scan(inner: &mut ArenaInner, sid: SegId, ss: &mut ScanState) -> Result<bool> {
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::seg_scan(inner, sid, ss),
        PoolClassId::Awl => awl::seg_scan(inner, sid, ss),
        PoolClassId::Snc => snc::seg_scan(inner, sid, ss),
    }
}

/// Fix one reference into a segment that is white for a scanned trace.
pub(crate) fn seg_fix(
    inner: &mut ArenaInner,
    sid: SegId,
    ss: &mut ScanState,
    ref_io: &mut Addr,
) -> Result<()> {
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::seg_fix(inner, sid, ss, ref_io),
        PoolClassId::Awl => awl::seg_fix(inner, sid, ss, ref_io),
        // SNC segments are never white, so fix cannot reach them.
        PoolClassId::Snc => Ok(()),
    }
}

/// Emergency variant of `seg_fix`: must not allocate and must not fail.
///
/// The non-moving classes record grey state in preallocated bit tables, so
/// their ordinary fix operations already satisfy the contract and serve
/// both modes.
pub(crate) fn seg_fix_emergency(
    inner: &mut ArenaInner,
    sid: SegId,
    ss: &mut ScanState,
    ref_io: &mut Addr,
) -> Result<()> {
    seg_fix(inner, sid, ss, ref_io)
}

/// Reclaim storage that stayed white for the trace.
pub(crate) fn seg_reclaim(inner: &mut ArenaInner, sid: SegId, trace: TraceId) {
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::seg_reclaim(inner, sid, trace),
        PoolClassId::Awl => awl::seg_reclaim(inner, sid, trace),
        PoolClassId::Snc => {}
    }
}

/// Visit each formatted object in the segment. The visitor receives client
/// addresses of non-white, non-buffered objects.
pub(crate) fn seg_walk(
    inner: &mut ArenaInner,
    sid: SegId,
    visitor: &mut dyn FnMut(Addr, PoolId),
) {
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::seg_walk(inner, sid, visitor),
        PoolClassId::Awl => awl::seg_walk(inner, sid, visitor),
        PoolClassId::Snc => snc::seg_walk(inner, sid, visitor),
    }
}

/// Refill an allocation point with at least `size` bytes. Returns the base
/// of the fresh buffered region after attaching the point.
pub(crate) fn buffer_fill(inner: &mut ArenaInner, ap: ApId, size: usize) -> Result<Addr> {
    let pid = inner.ap(ap).pool;
    match inner.pool(pid).class_id() {
        PoolClassId::Ams => ams::buffer_fill(inner, ap, size),
        PoolClassId::Awl => awl::buffer_fill(inner, ap, size),
        PoolClassId::Snc => snc::buffer_fill(inner, ap, size),
    }
}

/// Detach an allocation point, returning its unused region to the pool.
pub(crate) fn buffer_empty(inner: &mut ArenaInner, ap: ApId) {
    let Some(sid) = inner.ap(ap).seg else {
        return;
    };
    match class_of(inner, sid) {
        PoolClassId::Ams => ams::buffer_empty(inner, ap, sid),
        PoolClassId::Awl => awl::buffer_empty(inner, ap, sid),
        PoolClassId::Snc => snc::buffer_empty(inner, ap, sid),
    }
}

/// Push a lightweight allocation frame.
pub(crate) fn frame_push(inner: &mut ArenaInner, ap: ApId) -> Result<Option<Addr>> {
    let pid = inner.ap(ap).pool;
    match inner.pool(pid).class_id() {
        PoolClassId::Snc => snc::frame_push(inner, ap),
        _ => Err(GcError::Unimpl),
    }
}

/// Pop a lightweight allocation frame.
pub(crate) fn frame_pop(inner: &mut ArenaInner, ap: ApId, frame: Option<Addr>) -> Result<()> {
    let pid = inner.ap(ap).pool;
    match inner.pool(pid).class_id() {
        PoolClassId::Snc => snc::frame_pop(inner, ap, frame),
        _ => Err(GcError::Unimpl),
    }
}

/// Handle a barrier hit on a segment of this pool.
pub(crate) fn seg_access(
    inner: &mut ArenaInner,
    sid: SegId,
    addr: Addr,
    mode: crate::seg::AccessSet,
) -> Result<()> {
    match class_of(inner, sid) {
        PoolClassId::Awl => awl::seg_access(inner, sid, addr, mode),
        PoolClassId::Ams | PoolClassId::Snc => crate::trace::seg_access(inner, sid, mode),
    }
}

/// One line describing a pool, for diagnostics.
pub(crate) fn describe(inner: &ArenaInner, pid: PoolId) -> String {
    let pool = inner.pool(pid);
    format!(
        "{:?} align {} segs {} total {} free {} buffered {} new {} old {}",
        pool.class_id(),
        pool.align,
        pool.segs.len(),
        pool.gen.total_size,
        pool.gen.free_size,
        pool.gen.buffered_size,
        pool.gen.new_size,
        pool.gen.old_size,
    )
}
