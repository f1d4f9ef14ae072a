//! Segments and reference ranks.
//!
//! A segment is a contiguous grain-aligned span of the arena owned by
//! exactly one pool. All per-segment collection state lives here: rank set,
//! reference summary, per-trace white/grey membership, shield (barrier)
//! state, and a per-class payload.

use bitflags::bitflags;

use crate::arith::Addr;
use crate::arena::ArenaInner;
use crate::buffer::ApId;
use crate::pool::PoolId;
use crate::pool::ams::AmsSeg;
use crate::pool::awl::AwlSeg;
use crate::pool::snc::SncSeg;
use crate::shield;
use crate::trace::TraceSet;
use crate::zone::ZoneSet;

/// Index of a segment within the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SegId(pub(crate) u32);

/// Rank of a reference: how the collector must treat it when fixing.
///
/// Ranks are ordered; the trace engine scans in ascending rank bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Rank {
    /// May or may not be a reference; never moves or marks through padding.
    Ambig = 0,
    /// A genuine reference that keeps its target alive.
    Exact = 1,
    /// A reference that keeps its target alive for finalization purposes.
    Final = 2,
    /// A reference that does not keep its target alive; splatted to zero
    /// when the target dies.
    Weak = 3,
}

impl Rank {
    /// All ranks in ascending (band) order.
    pub const ALL: [Self; 4] = [Self::Ambig, Self::Exact, Self::Final, Self::Weak];

    /// The singleton rank set for this rank.
    #[must_use]
    pub fn to_set(self) -> RankSet {
        match self {
            Self::Ambig => RankSet::AMBIG,
            Self::Exact => RankSet::EXACT,
            Self::Final => RankSet::FINAL,
            Self::Weak => RankSet::WEAK,
        }
    }

    pub(crate) fn from_index(i: u8) -> Self {
        match i {
            0 => Self::Ambig,
            1 => Self::Exact,
            2 => Self::Final,
            _ => Self::Weak,
        }
    }
}

bitflags! {
    /// A set of reference ranks. Segments carry a singleton or empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RankSet: u8 {
        /// Contains ambiguous references.
        const AMBIG = 1 << 0;
        /// Contains exact references.
        const EXACT = 1 << 1;
        /// Contains final references.
        const FINAL = 1 << 2;
        /// Contains weak references.
        const WEAK = 1 << 3;
    }
}

bitflags! {
    /// A set of memory access kinds, used for barrier modes and hits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessSet: u8 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
    }
}

/// Shield bookkeeping for one segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShieldState {
    /// Accesses the collector wants denied to the mutator.
    pub(crate) desired: AccessSet,
    /// Accesses currently denied by page protection.
    pub(crate) effective: AccessSet,
    /// Expose nesting depth; protection is lifted while non-zero.
    pub(crate) depth: u16,
    /// Whether the segment sits in the deferred-protection queue.
    pub(crate) queued: bool,
}

impl ShieldState {
    pub(crate) const fn new() -> Self {
        Self {
            desired: AccessSet::empty(),
            effective: AccessSet::empty(),
            depth: 0,
            queued: false,
        }
    }
}

/// Per-class segment payload.
pub(crate) enum SegPayload {
    Ams(AmsSeg),
    Awl(AwlSeg),
    Snc(SncSeg),
}

impl SegPayload {
    pub(crate) fn as_ams(&self) -> &AmsSeg {
        match self {
            Self::Ams(s) => s,
            _ => unreachable!("segment payload is not AMS"),
        }
    }

    pub(crate) fn as_ams_mut(&mut self) -> &mut AmsSeg {
        match self {
            Self::Ams(s) => s,
            _ => unreachable!("segment payload is not AMS"),
        }
    }

    pub(crate) fn as_awl(&self) -> &AwlSeg {
        match self {
            Self::Awl(s) => s,
            _ => unreachable!("segment payload is not AWL"),
        }
    }

    pub(crate) fn as_awl_mut(&mut self) -> &mut AwlSeg {
        match self {
            Self::Awl(s) => s,
            _ => unreachable!("segment payload is not AWL"),
        }
    }

    pub(crate) fn as_snc(&self) -> &SncSeg {
        match self {
            Self::Snc(s) => s,
            _ => unreachable!("segment payload is not SNC"),
        }
    }

    pub(crate) fn as_snc_mut(&mut self) -> &mut SncSeg {
        match self {
            Self::Snc(s) => s,
            _ => unreachable!("segment payload is not SNC"),
        }
    }
}

/// Write-barrier deferral: scans before the barrier is (re-)raised.
pub(crate) const WB_DEFER_INIT: u8 = 2;
/// Deferral reset after a scan that found interesting references.
pub(crate) const WB_DEFER_DELAY: u8 = 2;
/// Deferral after a mutator write hit.
pub(crate) const WB_DEFER_HIT: u8 = 1;

/// A contiguous grain-aligned arena span owned by one pool.
pub(crate) struct Seg {
    pub(crate) base: Addr,
    pub(crate) limit: Addr,
    pub(crate) pool: PoolId,
    /// Ranks of references the segment may contain; singleton or empty.
    pub(crate) rank_set: RankSet,
    /// Conservative superset of the zones this segment refers into.
    pub(crate) summary: ZoneSet,
    /// Traces for which this segment is condemned. At most one member.
    pub(crate) white: TraceSet,
    /// Traces for which some objects in the segment are grey.
    pub(crate) grey: TraceSet,
    /// Write-barrier deferral countdown; see `WB_DEFER_*`.
    pub(crate) defer: u8,
    /// The allocation point attached to this segment, if any.
    pub(crate) buffer: Option<ApId>,
    pub(crate) shield: ShieldState,
    pub(crate) payload: SegPayload,
}

impl Seg {
    pub(crate) fn new(base: Addr, limit: Addr, pool: PoolId, payload: SegPayload) -> Self {
        Self {
            base,
            limit,
            pool,
            rank_set: RankSet::empty(),
            summary: ZoneSet::EMPTY,
            white: TraceSet::EMPTY,
            grey: TraceSet::EMPTY,
            defer: WB_DEFER_INIT,
            buffer: None,
            shield: ShieldState::new(),
            payload,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.limit - self.base
    }

    pub(crate) fn contains(&self, addr: Addr) -> bool {
        addr >= self.base && addr < self.limit
    }
}

/// Re-derive the segment's read barrier from its grey/flipped/rank state.
///
/// A segment that is grey for a flipped trace and can contain references
/// must deny mutator reads so barrier hits reach the collector.
pub(crate) fn sync_read_barrier(inner: &mut ArenaInner, sid: SegId) {
    let flipped = inner.flipped;
    let seg = inner.seg(sid);
    let want = !seg.rank_set.is_empty() && !seg.grey.inter(flipped).is_empty();
    if want {
        shield::raise(inner, sid, AccessSet::READ);
    } else {
        shield::lower(inner, sid, AccessSet::READ);
    }
}

/// Re-derive the segment's write barrier from its summary/defer state.
pub(crate) fn sync_write_barrier(inner: &mut ArenaInner, sid: SegId) {
    let seg = inner.seg(sid);
    let want = seg.summary != ZoneSet::UNIV && seg.defer == 0;
    if want {
        shield::raise(inner, sid, AccessSet::WRITE);
    } else {
        shield::lower(inner, sid, AccessSet::WRITE);
    }
}

/// Set the grey trace set, maintaining the read barrier.
pub(crate) fn set_grey(inner: &mut ArenaInner, sid: SegId, grey: TraceSet) {
    inner.seg_mut(sid).grey = grey;
    sync_read_barrier(inner, sid);
}

/// Add a trace to the grey set (the pool-class default `grey` operation).
pub(crate) fn greyen(inner: &mut ArenaInner, sid: SegId, trace: crate::trace::TraceId) {
    let grey = inner.seg(sid).grey.add(trace);
    set_grey(inner, sid, grey);
}

/// Set the summary, maintaining the write barrier.
pub(crate) fn set_summary(inner: &mut ArenaInner, sid: SegId, summary: ZoneSet) {
    inner.seg_mut(sid).summary = summary;
    sync_write_barrier(inner, sid);
}

/// Set the rank set, maintaining both barriers.
pub(crate) fn set_rank_set(inner: &mut ArenaInner, sid: SegId, rank_set: RankSet) {
    inner.seg_mut(sid).rank_set = rank_set;
    sync_read_barrier(inner, sid);
    sync_write_barrier(inner, sid);
}
