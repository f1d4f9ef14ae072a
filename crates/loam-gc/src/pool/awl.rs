//! AWL: automatic weak-linked pool class.
//!
//! Mark-and-sweep over alloc/mark/scanned grain tables, with two additions
//! over AMS: segments may carry the weak rank, and barrier hits during a
//! flipped trace can be serviced by *single-reference* scans within a
//! budget, so reading a weak table does not force whole-segment scans that
//! would destroy weak-splat opportunities.
//!
//! Weak-splat rule: fixing at weak rank finds a white, unmarked target and
//! stores zero over the reference; the target is not marked.

use crate::arena::ArenaInner;
use crate::arith::{self, Addr, WORD_WIDTH};
use crate::bt::BitTable;
use crate::buffer::{self, ApId};
use crate::error::Result;
use crate::events;
use crate::format::Format;
use crate::pool::{ChainId, Pool, PoolClass, PoolGen, PoolId};
use crate::seg::{self, AccessSet, Rank, SegId, SegPayload};
use crate::trace::{self, ScanCtx, ScanState, TraceId, TraceSet};

/// Find the dependent object of an object, if the client format links
/// objects in pairs (e.g. weak-key tables with strong-value tables).
///
/// While an object is scanned, its dependent's segment is exposed and its
/// summary made universal, so the client may write the dependent during
/// scanning.
pub type FindDependentFn = fn(Addr) -> Option<Addr>;

/// Barrier-provoked single-reference scans allowed per segment per trace.
pub const DEFAULT_SEG_SA_LIMIT: usize = 16;
/// Successive single-reference scans allowed per pool per trace.
pub const DEFAULT_TOTAL_SA_LIMIT: usize = 32;

/// Configuration for an AWL pool.
#[derive(Debug, Clone, Copy)]
pub struct AwlOptions {
    pub(crate) format: Format,
    pub(crate) chain: Option<(ChainId, usize)>,
    pub(crate) find_dependent: Option<FindDependentFn>,
    pub(crate) seg_sa_limit: usize,
    pub(crate) total_sa_limit: usize,
    pub(crate) extend_by: usize,
}

impl AwlOptions {
    /// Options for an AWL pool with the given format.
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            chain: None,
            find_dependent: None,
            seg_sa_limit: DEFAULT_SEG_SA_LIMIT,
            total_sa_limit: DEFAULT_TOTAL_SA_LIMIT,
            extend_by: 4096,
        }
    }

    /// Attach the pool to a generation of a chain.
    #[must_use]
    pub fn chain(mut self, chain: ChainId, gen: usize) -> Self {
        self.chain = Some((chain, gen));
        self
    }

    /// Register the dependent-object callback.
    #[must_use]
    pub fn find_dependent(mut self, f: FindDependentFn) -> Self {
        self.find_dependent = Some(f);
        self
    }

    /// Per-segment single-access budget.
    #[must_use]
    pub fn seg_sa_limit(mut self, limit: usize) -> Self {
        self.seg_sa_limit = limit;
        self
    }

    /// Per-pool successive single-access budget.
    #[must_use]
    pub fn total_sa_limit(mut self, limit: usize) -> Self {
        self.total_sa_limit = limit;
        self
    }

    /// Preferred segment size for refills.
    #[must_use]
    pub fn extend_by(mut self, bytes: usize) -> Self {
        self.extend_by = bytes;
        self
    }
}

pub(crate) struct AwlPool {
    pub(crate) find_dependent: Option<FindDependentFn>,
    /// Successive single accesses since the last whole-segment scan.
    pub(crate) succ_accesses: usize,
    pub(crate) seg_sa_limit: usize,
    pub(crate) total_sa_limit: usize,
}

/// Per-segment AWL state. Unlike AMS there is no bump mode: the allocation
/// table is always live.
pub(crate) struct AwlSeg {
    pub(crate) grains: usize,
    pub(crate) free_grains: usize,
    pub(crate) buffered_grains: usize,
    pub(crate) new_grains: usize,
    pub(crate) old_grains: usize,
    pub(crate) alloc: BitTable,
    pub(crate) mark: BitTable,
    pub(crate) scanned: BitTable,
    /// Single accesses serviced on this segment this trace.
    pub(crate) single_accesses: usize,
}

impl AwlSeg {
    pub(crate) fn new(grains: usize) -> Self {
        Self {
            grains,
            free_grains: grains,
            buffered_grains: 0,
            new_grains: 0,
            old_grains: 0,
            alloc: BitTable::new(grains),
            mark: BitTable::new(grains),
            scanned: BitTable::new(grains),
            single_accesses: 0,
        }
    }

    pub(crate) fn check(&self) {
        debug_assert_eq!(
            self.grains,
            self.free_grains + self.buffered_grains + self.new_grains + self.old_grains
        );
    }
}

pub(crate) fn make_pool(options: &AwlOptions) -> Pool {
    let align = options.format.align.max(std::mem::size_of::<usize>());
    Pool {
        class: PoolClass::Awl(AwlPool {
            find_dependent: options.find_dependent,
            succ_accesses: 0,
            seg_sa_limit: options.seg_sa_limit,
            total_sa_limit: options.total_sa_limit,
        }),
        format: options.format,
        align,
        align_shift: align.trailing_zeros(),
        extend_by: options.extend_by.max(align),
        segs: Vec::new(),
        gen: PoolGen {
            chain: options.chain,
            ..PoolGen::default()
        },
    }
}

fn awl_pool(inner: &ArenaInner, pid: PoolId) -> &AwlPool {
    match &inner.pool(pid).class {
        PoolClass::Awl(p) => p,
        _ => unreachable!("AWL operation on non-AWL pool"),
    }
}

fn awl_pool_mut(inner: &mut ArenaInner, pid: PoolId) -> &mut AwlPool {
    match &mut inner.pool_mut(pid).class {
        PoolClass::Awl(p) => p,
        _ => unreachable!("AWL operation on non-AWL pool"),
    }
}

fn seg_create(inner: &mut ArenaInner, pid: PoolId, size: usize, rank: Rank) -> Result<SegId> {
    let (bytes, grains) = {
        let pool = inner.pool(pid);
        let bytes = arith::align_up(size.max(pool.extend_by), inner.grain_size);
        (bytes, bytes >> pool.align_shift)
    };
    let sid = inner.place_seg(pid, bytes, SegPayload::Awl(AwlSeg::new(grains)))?;
    seg::set_rank_set(inner, sid, rank.to_set());
    Ok(sid)
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

pub(crate) fn buffer_fill(inner: &mut ArenaInner, ap: ApId, size: usize) -> Result<Addr> {
    if let Some(sid) = inner.ap(ap).seg {
        buffer_empty(inner, ap, sid);
    }

    let (pid, rank) = {
        let a = inner.ap(ap);
        (a.pool, a.rank)
    };
    let grains = inner.pool(pid).grains(arith::align_up(size, inner.pool(pid).align));

    let mut found = None;
    for sid in inner.pool(pid).segs.clone() {
        let s = inner.seg(sid);
        if s.buffer.is_some()
            || s.rank_set != rank.to_set()
            || !s.white.is_empty()
            || !s.grey.is_empty()
        {
            continue;
        }
        let awl = s.payload.as_awl();
        if let Some(range) = awl.alloc.find_reset_run(0, awl.grains, grains) {
            found = Some((sid, range));
            break;
        }
    }
    let (sid, (base_i, limit_i)) = match found {
        Some(f) => f,
        None => {
            let sid = seg_create(inner, pid, size, rank)?;
            let total = inner.seg(sid).payload.as_awl().grains;
            (sid, (0, total))
        }
    };

    let (base, limit) = {
        let seg_base = inner.seg(sid).base;
        let pool = inner.pool(pid);
        (
            pool.addr_of_index(seg_base, base_i),
            pool.addr_of_index(seg_base, limit_i),
        )
    };
    {
        let awl = inner.seg_mut(sid).payload.as_awl_mut();
        awl.alloc.set_range(base_i, limit_i);
        // Allocation is black.
        awl.mark.set_range(base_i, limit_i);
        awl.scanned.set_range(base_i, limit_i);
        debug_assert!(awl.free_grains >= limit_i - base_i);
        awl.free_grains -= limit_i - base_i;
        awl.buffered_grains += limit_i - base_i;
        awl.check();
    }
    inner.pool_mut(pid).gen.account_fill(limit - base);
    buffer::attach(inner, ap, sid, base, limit);
    Ok(base)
}

pub(crate) fn buffer_empty(inner: &mut ArenaInner, ap: ApId, sid: SegId) {
    let (sid2, base, init, limit) = buffer::take_range(inner, ap);
    debug_assert_eq!(sid.0, sid2.0);
    let pid = inner.seg(sid).pool;
    let seg_base = inner.seg(sid).base;
    let (base_i, init_i, limit_i) = {
        let pool = inner.pool(pid);
        (
            pool.index_of_addr(seg_base, base),
            pool.index_of_addr(seg_base, init),
            pool.index_of_addr(seg_base, limit),
        )
    };
    {
        let awl = inner.seg_mut(sid).payload.as_awl_mut();
        if init_i < limit_i {
            awl.alloc.reset_range(init_i, limit_i);
            awl.mark.reset_range(init_i, limit_i);
            awl.scanned.reset_range(init_i, limit_i);
        }
        let (used, unused) = (init_i - base_i, limit_i - init_i);
        debug_assert!(awl.buffered_grains >= used + unused);
        awl.buffered_grains -= used + unused;
        awl.new_grains += used;
        awl.free_grains += unused;
        awl.check();
    }
    inner
        .pool_mut(pid)
        .gen
        .account_empty(init - base, limit - init);
}

// ---------------------------------------------------------------------------
// Object iteration
// ---------------------------------------------------------------------------

/// Apply `f` to every allocated object, skipping the buffer and free runs.
/// The segment must be exposed.
fn iterate_objects(
    inner: &mut ArenaInner,
    sid: SegId,
    mut f: impl FnMut(&mut ArenaInner, usize, Addr, Addr) -> Result<()>,
) -> Result<()> {
    let (seg_base, limit, pid) = {
        let s = inner.seg(sid);
        (s.base, s.limit, s.pool)
    };
    let format = inner.pool(pid).format;
    let align_shift = inner.pool(pid).align_shift;

    let mut p = seg_base;
    while p < limit {
        let scan_l = buffer::scan_limit(inner, sid);
        let buf_l = buffer::buffer_limit(inner, sid);
        if p == scan_l && scan_l != buf_l {
            p = buf_l;
            continue;
        }
        let i = (p - seg_base) >> align_shift;
        let next_free = {
            let awl = inner.seg(sid).payload.as_awl();
            if awl.alloc.get(i) {
                None
            } else {
                Some(
                    awl.alloc
                        .find_set(i, awl.grains)
                        .map_or(limit, |j| seg_base + (j << align_shift)),
                )
            }
        };
        if let Some(next) = next_free {
            debug_assert!(next > p);
            p = next;
            continue;
        }
        let client = p + format.header_size;
        // SAFETY: exposed by the caller; skip parses the object.
        let next = (format.skip)(client) - format.header_size;
        debug_assert!(next > p);
        f(inner, i, p, next)?;
        p = next;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing operations
// ---------------------------------------------------------------------------

pub(crate) fn seg_whiten(inner: &mut ArenaInner, sid: SegId, trace: TraceId) -> Result<()> {
    debug_assert!(inner.seg(sid).white.is_empty(), "single-white violated");

    let pid = inner.seg(sid).pool;
    let (scan_li, buf_li) = {
        let seg = inner.seg(sid);
        if seg.buffer.is_none() {
            (None, None)
        } else {
            let pool = inner.pool(pid);
            (
                Some(pool.index_of_addr(seg.base, buffer::scan_limit(inner, sid))),
                Some(pool.index_of_addr(seg.base, buffer::buffer_limit(inner, sid))),
            )
        }
    };

    let (aged_buffered, aged_new, condemned) = {
        let awl = inner.seg_mut(sid).payload.as_awl_mut();
        let grains = awl.grains;
        let (scan_li, buf_li) = (scan_li.unwrap_or(grains), buf_li.unwrap_or(grains));

        awl.mark.reset_range(0, scan_li);
        awl.scanned.reset_range(0, scan_li);
        if scan_li < buf_li {
            awl.mark.set_range(scan_li, buf_li);
            awl.scanned.set_range(scan_li, buf_li);
        }
        awl.mark.reset_range(buf_li, grains);
        awl.scanned.reset_range(buf_li, grains);
        awl.single_accesses = 0;

        let uncondemned = buf_li - scan_li;
        debug_assert!(awl.buffered_grains >= uncondemned);
        let aged_buffered = awl.buffered_grains - uncondemned;
        let aged_new = awl.new_grains;
        awl.old_grains += aged_buffered + aged_new;
        awl.buffered_grains = uncondemned;
        awl.new_grains = 0;
        awl.check();
        (aged_buffered, aged_new, awl.old_grains)
    };

    let pool = inner.pool_mut(pid);
    let (aged_buffered, aged_new, condemned_bytes) = (
        pool.grains_size(aged_buffered),
        pool.grains_size(aged_new),
        pool.grains_size(condemned),
    );
    pool.gen.account_age(aged_buffered, aged_new);

    if condemned_bytes > 0 {
        inner.trace_mut(trace).condemned += condemned_bytes;
        let seg = inner.seg_mut(sid);
        seg.white = seg.white.add(trace);
    }
    Ok(())
}

/// The class grey operation: make every object in the segment grey.
pub(crate) fn seg_greyen(inner: &mut ArenaInner, sid: SegId, trace: TraceId) {
    if inner.seg(sid).white.contains(trace) {
        return;
    }
    // The colour tables belong to the white trace if there is one; in that
    // case only the segment-level flag changes and scanning falls back to
    // a whole-segment pass.
    if inner.seg(sid).white.is_empty() {
        let awl = inner.seg_mut(sid).payload.as_awl_mut();
        let grains = awl.grains;
        let mut j = 0;
        while let Some((lo, hi)) = awl.alloc.find_set_run(j, grains, 1) {
            awl.mark.set_range(lo, hi);
            awl.scanned.reset_range(lo, hi);
            j = hi;
            if j >= grains {
                break;
            }
        }
    }
    seg::greyen(inner, sid, trace);
}

pub(crate) fn seg_blacken(inner: &mut ArenaInner, sid: SegId, traces: TraceSet) {
    if inner.seg(sid).white.inter(traces).is_empty() {
        return;
    }
    let awl = inner.seg_mut(sid).payload.as_awl_mut();
    let grains = awl.grains;
    let mut j = 0;
    while let Some(i) = awl.mark.find_set(j, grains) {
        if !awl.scanned.get(i) {
            awl.scanned.set(i);
        }
        j = i + 1;
    }
}

pub(crate) fn seg_scan(inner: &mut ArenaInner, sid: SegId, ss: &mut ScanState) -> Result<bool> {
    let scan_all = !ss.traces.diff(inner.seg(sid).white).is_empty();
    note_scan(inner, sid);

    if scan_all {
        iterate_objects(inner, sid, |inner, _i, p, next| {
            scan_object(inner, ss, sid, p, next)
        })?;
        return Ok(true);
    }

    loop {
        let mut any_scanned = false;
        iterate_objects(inner, sid, |inner, i, p, next| {
            let grey = {
                let awl = inner.seg(sid).payload.as_awl();
                awl.mark.get(i) && !awl.scanned.get(i)
            };
            if !grey {
                return Ok(());
            }
            scan_object(inner, ss, sid, p, next)?;
            any_scanned = true;
            let (seg_base, shift) = (inner.seg(sid).base, inner.pool(inner.seg(sid).pool).align_shift);
            let j = (next - seg_base) >> shift;
            let awl = inner.seg_mut(sid).payload.as_awl_mut();
            awl.scanned.set_range(i, j.max(i + 1));
            Ok(())
        })?;
        if !any_scanned {
            break;
        }
    }
    Ok(false)
}

/// Scan one object, exposing its dependent object (if any) for the
/// duration so the client may update it.
fn scan_object(
    inner: &mut ArenaInner,
    ss: &mut ScanState,
    sid: SegId,
    p: Addr,
    next: Addr,
) -> Result<()> {
    let pid = inner.seg(sid).pool;
    let format = inner.pool(pid).format;
    let (base, limit) = (p + format.header_size, next + format.header_size);

    let dependent = awl_pool(inner, pid)
        .find_dependent
        .and_then(|f| f(base))
        .and_then(|dep| inner.seg_of_addr(dep));
    if let Some(dep_sid) = dependent {
        crate::shield::expose(inner, dep_sid);
        seg::set_summary(inner, dep_sid, crate::zone::ZoneSet::UNIV);
    }

    let res = {
        let mut ctx = ScanCtx {
            inner: &mut *inner,
            ss,
        };
        ctx.note_area(base, limit);
        (format.scan)(&mut ctx, base, limit)
    };

    if let Some(dep_sid) = dependent {
        crate::shield::cover(inner, dep_sid);
    }
    res
}

pub(crate) fn seg_fix(
    inner: &mut ArenaInner,
    sid: SegId,
    ss: &mut ScanState,
    ref_io: &mut Addr,
) -> Result<()> {
    let (seg_base, pid) = {
        let s = inner.seg(sid);
        (s.base, s.pool)
    };
    let format = inner.pool(pid).format;
    let align_shift = inner.pool(pid).align_shift;

    let client = *ref_io;
    if client < seg_base + format.header_size {
        debug_assert_eq!(ss.rank, Rank::Ambig);
        return Ok(());
    }
    let base = client - format.header_size;
    let i = (base - seg_base) >> align_shift;

    if ss.rank == Rank::Ambig {
        let aligned = arith::is_aligned(base, WORD_WIDTH / 8);
        if !aligned || !inner.seg(sid).payload.as_awl().alloc.get(i) {
            return Ok(());
        }
    }

    let marked = inner.seg(sid).payload.as_awl().mark.get(i);
    if !marked {
        ss.was_marked = false;
        if ss.rank == Rank::Weak {
            // Weak splat.
            *ref_io = 0;
        } else {
            {
                let awl = inner.seg_mut(sid).payload.as_awl_mut();
                awl.mark.set(i);
            }
            let mut grey = inner.seg(sid).grey;
            for ti in ss.traces.iter() {
                grey = grey.add(ti);
            }
            seg::set_grey(inner, sid, grey);
        }
    }
    Ok(())
}

pub(crate) fn seg_reclaim(inner: &mut ArenaInner, sid: SegId, trace: TraceId) {
    let (seg_base, pid) = {
        let s = inner.seg(sid);
        (s.base, s.pool)
    };
    let format = inner.pool(pid).format;
    let align_shift = inner.pool(pid).align_shift;

    let mut reclaimed = 0usize;
    let mut preserved = 0usize;
    let mut i = 0;
    loop {
        let grains = inner.seg(sid).payload.as_awl().grains;
        if i >= grains {
            break;
        }
        if !inner.seg(sid).payload.as_awl().alloc.get(i) {
            i += 1;
            continue;
        }
        let p = seg_base + (i << align_shift);
        let scan_l = buffer::scan_limit(inner, sid);
        let buf_l = buffer::buffer_limit(inner, sid);
        if p == scan_l && scan_l != buf_l {
            i = (buf_l - seg_base) >> align_shift;
            continue;
        }
        let client = p + format.header_size;
        // SAFETY: white segments are not read-protected; skip only reads.
        let next = (format.skip)(client) - format.header_size;
        let j = (next - seg_base) >> align_shift;
        let awl = inner.seg_mut(sid).payload.as_awl_mut();
        if awl.mark.get(i) {
            debug_assert!(awl.scanned.get(i), "marked but unscanned at reclaim");
            // Normalize the survivor's whole extent.
            awl.mark.set_range(i, j);
            awl.scanned.set_range(i, j);
            preserved += 1;
        } else {
            awl.mark.reset_range(i, j);
            awl.scanned.set_range(i, j);
            awl.alloc.reset_range(i, j);
            reclaimed += j - i;
        }
        i = j;
    }

    let (free_grains, grains) = {
        let awl = inner.seg_mut(sid).payload.as_awl_mut();
        debug_assert!(awl.old_grains >= reclaimed);
        awl.old_grains -= reclaimed;
        awl.free_grains += reclaimed;
        awl.check();
        (awl.free_grains, awl.grains)
    };

    let bytes = inner.pool(pid).grains_size(reclaimed);
    inner.pool_mut(pid).gen.account_reclaim(bytes);
    {
        let t = inner.trace_mut(trace);
        t.reclaim_size += bytes;
        t.preserved_in_place_count += preserved;
    }
    {
        let seg = inner.seg_mut(sid);
        seg.white = seg.white.del(trace);
    }

    if free_grains == grains && inner.seg(sid).buffer.is_none() {
        inner.free_seg(sid);
    }
}

pub(crate) fn seg_walk(
    inner: &mut ArenaInner,
    sid: SegId,
    visitor: &mut dyn FnMut(Addr, PoolId),
) {
    let pid = inner.seg(sid).pool;
    let header = inner.pool(pid).format.header_size;
    let mut guard = crate::shield::Exposed::new(inner, sid);
    let inner = guard.inner();
    let _ = iterate_objects(inner, sid, |inner, i, p, _next| {
        let awl = inner.seg(sid).payload.as_awl();
        if awl.mark.get(i) && awl.scanned.get(i) {
            visitor(p + header, pid);
        }
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Barrier handling
// ---------------------------------------------------------------------------

fn can_try_single_access(inner: &ArenaInner, sid: SegId, addr: Addr) -> bool {
    // Single access pays off only on weak segments; anything else takes
    // the ordinary whole-segment path. No flipped trace means the hit is a
    // plain write-barrier event.
    let seg = inner.seg(sid);
    if seg.rank_set != Rank::Weak.to_set() || inner.flipped.is_empty() {
        return false;
    }
    if !arith::is_aligned(addr, WORD_WIDTH / 8) {
        return false;
    }
    let awl = awl_pool(inner, seg.pool);
    if awl.succ_accesses >= awl.total_sa_limit {
        return false;
    }
    inner.seg(sid).payload.as_awl().single_accesses < awl.seg_sa_limit
}

fn note_ref_access(inner: &mut ArenaInner, sid: SegId) {
    let pid = inner.seg(sid).pool;
    inner.seg_mut(sid).payload.as_awl_mut().single_accesses += 1;
    awl_pool_mut(inner, pid).succ_accesses += 1;
}

/// A whole-segment scan ends any run of single accesses.
fn note_scan(inner: &mut ArenaInner, sid: SegId) {
    let pid = inner.seg(sid).pool;
    inner.seg_mut(sid).payload.as_awl_mut().single_accesses = 0;
    awl_pool_mut(inner, pid).succ_accesses = 0;
}

pub(crate) fn seg_access(
    inner: &mut ArenaInner,
    sid: SegId,
    addr: Addr,
    mode: AccessSet,
) -> Result<()> {
    let read_hit = mode.contains(AccessSet::READ)
        && inner.seg(sid).shield.desired.contains(AccessSet::READ);
    if read_hit && can_try_single_access(inner, sid, addr) {
        let traces = inner.flipped;
        let rank = trace::rank_for_access(inner, sid);
        trace::scan_single_ref(inner, traces, rank, sid, addr);
        note_ref_access(inner, sid);
        events::single_access(inner.seg(sid).base, addr);
        for ti in traces.iter() {
            inner.trace_mut(ti).single_scans += 1;
        }
        return Ok(());
    }
    // Whole-segment scan, losing weak-splat opportunities on this segment.
    trace::seg_access(inner, sid, mode)
}
