//! AMS: automatic mark-and-sweep pool class.
//!
//! Non-moving collection over grain-indexed bit tables. Three tables per
//! segment encode allocation and, while colour tables are in use, the
//! tri-color state:
//!
//! - white: `alloc && !mark`
//! - grey:  `alloc && mark && !scanned`
//! - black: `alloc && mark && scanned`
//!
//! A fresh segment allocates by bumping `first_free`; the allocation table
//! is materialized the first time the segment is condemned or a buffer is
//! returned out of order. `mark && !scanned` with `!alloc` is an invalid
//! colour and never occurs.

use crate::arena::ArenaInner;
use crate::arith::{self, Addr};
use crate::bt::BitTable;
use crate::buffer::{self, ApId};
use crate::error::{GcError, Result};
use crate::events;
use crate::format::Format;
use crate::pool::{ChainId, Pool, PoolClass, PoolGen, PoolId};
use crate::seg::{self, Rank, RankSet, SegId, SegPayload};
use crate::shield;
use crate::trace::{ScanCtx, ScanState, TraceId, TraceSet};

/// Debug behaviour for an AMS pool (the AMS debug class).
#[derive(Debug, Clone, Copy)]
pub struct DebugOptions {
    /// Byte pattern written over reclaimed storage.
    pub splat_pattern: u8,
    /// Whether reclaimed storage is checked to still hold the pattern at
    /// the next condemnation.
    pub free_check: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            splat_pattern: 0xA5,
            free_check: true,
        }
    }
}

/// Configuration for an AMS pool.
#[derive(Debug, Clone, Copy)]
pub struct AmsOptions {
    pub(crate) format: Format,
    pub(crate) chain: Option<(ChainId, usize)>,
    pub(crate) support_ambiguous: bool,
    pub(crate) debug: Option<DebugOptions>,
    pub(crate) extend_by: usize,
}

impl AmsOptions {
    /// Options for an AMS pool with the given format.
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            chain: None,
            support_ambiguous: true,
            debug: None,
            extend_by: 4096,
        }
    }

    /// Attach the pool to a generation of a chain.
    #[must_use]
    pub fn chain(mut self, chain: ChainId, gen: usize) -> Self {
        self.chain = Some((chain, gen));
        self
    }

    /// Whether ambiguous references may keep this pool's objects alive.
    #[must_use]
    pub fn support_ambiguous(mut self, support: bool) -> Self {
        self.support_ambiguous = support;
        self
    }

    /// Enable the debug class behaviour (free splatting and checking).
    #[must_use]
    pub fn debug(mut self, debug: DebugOptions) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Preferred segment size for refills.
    #[must_use]
    pub fn extend_by(mut self, bytes: usize) -> Self {
        self.extend_by = bytes;
        self
    }
}

pub(crate) struct AmsPool {
    pub(crate) support_ambiguous: bool,
    pub(crate) debug: Option<DebugOptions>,
}

/// Per-segment AMS state.
pub(crate) struct AmsSeg {
    pub(crate) grains: usize,
    pub(crate) free_grains: usize,
    pub(crate) buffered_grains: usize,
    pub(crate) new_grains: usize,
    pub(crate) old_grains: usize,
    pub(crate) alloc: BitTable,
    pub(crate) mark: BitTable,
    pub(crate) scanned: BitTable,
    /// When false, allocation state is `i < first_free`.
    pub(crate) alloc_table_in_use: bool,
    pub(crate) first_free: usize,
    pub(crate) colour_tables_in_use: bool,
    /// Some object was newly greyed since the last scan pass.
    pub(crate) marks_changed: bool,
    /// An ambiguous fix landed mid-scan; grey runs are unreliable until a
    /// full-segment pass.
    pub(crate) ambiguous_fixes: bool,
}

impl AmsSeg {
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
            alloc_table_in_use: false,
            first_free: 0,
            colour_tables_in_use: false,
            marks_changed: false,
            ambiguous_fixes: false,
        }
    }

    pub(crate) fn check(&self) {
        debug_assert_eq!(
            self.grains,
            self.free_grains + self.buffered_grains + self.new_grains + self.old_grains
        );
        if !self.alloc_table_in_use {
            debug_assert!(self.first_free <= self.grains);
        }
    }

    #[inline]
    pub(crate) fn alloced(&self, i: usize) -> bool {
        if self.alloc_table_in_use {
            self.alloc.get(i)
        } else {
            i < self.first_free
        }
    }

    #[inline]
    pub(crate) fn is_white(&self, i: usize) -> bool {
        self.alloced(i) && !self.mark.get(i)
    }

    #[inline]
    pub(crate) fn is_grey(&self, i: usize) -> bool {
        self.alloced(i) && self.mark.get(i) && !self.scanned.get(i)
    }

    /// Find the next grey grain in [from, to).
    fn find_grey(&self, from: usize, to: usize) -> Option<usize> {
        let mut j = from;
        while let Some(i) = self.mark.find_set(j, to) {
            if !self.scanned.get(i) && self.alloced(i) {
                return Some(i);
            }
            j = i + 1;
        }
        None
    }

    /// Switch from bump allocation to the materialized allocation table.
    fn materialize_alloc(&mut self) {
        if self.alloc_table_in_use {
            return;
        }
        self.alloc.set_range(0, self.first_free);
        if self.first_free < self.grains {
            self.alloc.reset_range(self.first_free, self.grains);
        }
        self.alloc_table_in_use = true;
        self.first_free = self.grains;
    }
}

pub(crate) fn make_pool(options: &AmsOptions) -> Pool {
    let align = options.format.align.max(std::mem::size_of::<usize>());
    Pool {
        class: PoolClass::Ams(AmsPool {
            support_ambiguous: options.support_ambiguous,
            debug: options.debug,
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

/// Create a fresh AMS segment big enough for `size` bytes.
fn seg_create(inner: &mut ArenaInner, pid: PoolId, size: usize) -> Result<SegId> {
    let (bytes, grains) = {
        let pool = inner.pool(pid);
        let bytes = arith::align_up(size.max(pool.extend_by), inner.grain_size);
        (bytes, bytes >> pool.align_shift)
    };
    let sid = inner.place_seg(pid, bytes, SegPayload::Ams(AmsSeg::new(grains)))?;
    seg::set_rank_set(inner, sid, RankSet::EXACT);
    if let Some(debug) = debug_options(inner, sid) {
        // Free storage carries the splat pattern from the start, so the
        // free check holds over never-allocated grains too.
        let (base, size) = {
            let s = inner.seg(sid);
            (s.base, s.size())
        };
        // SAFETY: freshly committed storage owned by the new segment.
        unsafe {
            std::ptr::write_bytes(base as *mut u8, debug.splat_pattern, size);
        }
    }
    Ok(sid)
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Find a free run of at least `grains` in the segment, if the segment can
/// take a buffer at all.
fn seg_buffer_range(inner: &ArenaInner, sid: SegId, grains: usize) -> Option<(usize, usize)> {
    let s = inner.seg(sid);
    if s.buffer.is_some() || !s.white.is_empty() || !s.grey.is_empty() {
        return None;
    }
    let ams = s.payload.as_ams();
    if ams.colour_tables_in_use {
        return None;
    }
    if ams.alloc_table_in_use {
        ams.alloc.find_reset_run(0, ams.grains, grains)
    } else if ams.first_free + grains <= ams.grains {
        Some((ams.first_free, ams.grains))
    } else {
        None
    }
}

pub(crate) fn buffer_fill(inner: &mut ArenaInner, ap: ApId, size: usize) -> Result<Addr> {
    if inner.ap(ap).seg.is_some() {
        let sid = inner.ap(ap).seg.expect("attached");
        buffer_empty(inner, ap, sid);
    }

    let pid = inner.ap(ap).pool;
    let grains = inner.pool(pid).grains(arith::align_up(size, inner.pool(pid).align));

    let mut found = None;
    for sid in inner.pool(pid).segs.clone() {
        if let Some(range) = seg_buffer_range(inner, sid, grains) {
            found = Some((sid, range));
            break;
        }
    }
    let (sid, (base_i, limit_i)) = match found {
        Some(f) => f,
        None => {
            let sid = seg_create(inner, pid, size)?;
            let grains_total = inner.seg(sid).payload.as_ams().grains;
            (sid, (0, grains_total))
        }
    };

    // Claim the run for the buffer; the unused tail comes back at detach.
    let (base, limit) = {
        let seg_base = inner.seg(sid).base;
        let pool = inner.pool(pid);
        (
            pool.addr_of_index(seg_base, base_i),
            pool.addr_of_index(seg_base, limit_i),
        )
    };
    {
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        if ams.alloc_table_in_use {
            ams.alloc.set_range(base_i, limit_i);
        } else {
            debug_assert_eq!(base_i, ams.first_free);
            ams.first_free = limit_i;
        }
        debug_assert!(ams.free_grains >= limit_i - base_i);
        ams.free_grains -= limit_i - base_i;
        ams.buffered_grains += limit_i - base_i;
        if ams.colour_tables_in_use {
            // Allocation is black during a collection.
            ams.mark.set_range(base_i, limit_i);
            ams.scanned.set_range(base_i, limit_i);
        }
        ams.check();
    }
    let bytes = limit - base;
    inner.pool_mut(pid).gen.account_fill(bytes);
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
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        if !ams.alloc_table_in_use && limit_i == ams.first_free {
            // The buffer was the last range handed out; just rewind.
            ams.first_free = init_i;
        } else {
            ams.materialize_alloc();
        }
        if ams.alloc_table_in_use && init_i < limit_i {
            ams.alloc.reset_range(init_i, limit_i);
            if ams.colour_tables_in_use {
                // The unused tail is no longer allocated, so it carries no
                // colour; clear the black bits set at fill.
                ams.mark.reset_range(init_i, limit_i);
                ams.scanned.reset_range(init_i, limit_i);
            }
        }
        let unused = limit_i - init_i;
        let used = init_i - base_i;
        debug_assert!(ams.buffered_grains >= unused + used);
        ams.free_grains += unused;
        ams.buffered_grains -= unused + used;
        ams.new_grains += used;
        ams.check();
    }
    if init < limit {
        if let Some(debug) = debug_options(inner, sid) {
            // The returned tail is free again; restore the splat pattern.
            let mut guard = shield::Exposed::new(inner, sid);
            let _inner = guard.inner();
            // SAFETY: exposed above; the tail is buffered storage the
            // mutator no longer holds.
            unsafe {
                std::ptr::write_bytes(init as *mut u8, debug.splat_pattern, limit - init);
            }
        }
    }
    inner
        .pool_mut(pid)
        .gen
        .account_empty(init - base, limit - init);
}

// ---------------------------------------------------------------------------
// Object iteration
// ---------------------------------------------------------------------------

/// Apply `f` to every allocated object in the segment, skipping the
/// buffered region and free runs. The segment must be exposed: `skip` reads
/// object memory.
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
    let (align_shift, align) = (inner.pool(pid).align_shift, inner.pool(pid).align);

    let mut p = seg_base;
    while p < limit {
        let scan_l = buffer::scan_limit(inner, sid);
        let buf_l = buffer::buffer_limit(inner, sid);
        if p == scan_l && scan_l != buf_l {
            p = buf_l;
            continue;
        }
        let i = (p - seg_base) >> align_shift;
        let (alloced, next_alloc) = {
            let ams = inner.seg(sid).payload.as_ams();
            if ams.alloced(i) {
                (true, 0)
            } else if ams.alloc_table_in_use {
                let next = ams
                    .alloc
                    .find_set(i, ams.grains)
                    .map_or(limit, |j| seg_base + (j << align_shift));
                (false, next)
            } else {
                (false, limit)
            }
        };
        if !alloced {
            debug_assert!(next_alloc > p);
            p = next_alloc;
            continue;
        }
        let client = p + format.header_size;
        // SAFETY: the caller exposed the segment; skip parses the object.
        let next = (format.skip)(client) - format.header_size;
        debug_assert!(next > p && arith::is_aligned(next - seg_base, align));
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

    if let Some(debug) = debug_options(inner, sid) {
        if debug.free_check {
            free_check(inner, sid, debug.splat_pattern);
        }
    }

    let (scan_li, buf_li) = buffer_indices(inner, sid);
    let pid = inner.seg(sid).pool;
    let (aged_buffered, aged_new, condemned) = {
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        debug_assert!(!ams.colour_tables_in_use);
        ams.colour_tables_in_use = true;
        ams.materialize_alloc();

        let grains = ams.grains;
        let (scan_li, buf_li) = (scan_li.unwrap_or(grains), buf_li.unwrap_or(grains));

        // Whiten everything outside the buffer; the buffered region is
        // black (allocation is black) and stays uncondemned.
        ams.mark.reset_range(0, scan_li);
        ams.scanned.reset_range(0, scan_li);
        if scan_li < buf_li {
            ams.mark.set_range(scan_li, buf_li);
            ams.scanned.set_range(scan_li, buf_li);
        }
        ams.mark.reset_range(buf_li, grains);
        ams.scanned.reset_range(buf_li, grains);

        let uncondemned = buf_li - scan_li;
        debug_assert!(ams.buffered_grains >= uncondemned);
        let aged_buffered = ams.buffered_grains - uncondemned;
        let aged_new = ams.new_grains;
        ams.old_grains += aged_buffered + aged_new;
        ams.buffered_grains = uncondemned;
        ams.new_grains = 0;
        ams.marks_changed = false;
        ams.ambiguous_fixes = false;

        let condemned = if ams.old_grains > 0 {
            ams.old_grains
        } else {
            ams.colour_tables_in_use = false;
            0
        };
        ams.check();
        (aged_buffered, aged_new, condemned)
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

fn buffer_indices(inner: &ArenaInner, sid: SegId) -> (Option<usize>, Option<usize>) {
    let seg = inner.seg(sid);
    if seg.buffer.is_none() {
        return (None, None);
    }
    let pool = inner.pool(seg.pool);
    let scan_l = buffer::scan_limit(inner, sid);
    let buf_l = buffer::buffer_limit(inner, sid);
    (
        Some(pool.index_of_addr(seg.base, scan_l)),
        Some(pool.index_of_addr(seg.base, buf_l)),
    )
}

fn debug_options(inner: &ArenaInner, sid: SegId) -> Option<DebugOptions> {
    let pid = inner.seg(sid).pool;
    match &inner.pool(pid).class {
        PoolClass::Ams(ams) => ams.debug,
        _ => None,
    }
}

/// Verify that free grains still hold the splat pattern.
fn free_check(inner: &mut ArenaInner, sid: SegId, pattern: u8) {
    let (seg_base, pid) = {
        let s = inner.seg(sid);
        (s.base, s.pool)
    };
    let align_shift = inner.pool(pid).align_shift;
    let mut guard = shield::Exposed::new(inner, sid);
    let inner = guard.inner();
    let ams = inner.seg(sid).payload.as_ams();
    if !ams.alloc_table_in_use {
        return;
    }
    let mut j = 0;
    while let Some((lo, hi)) = ams.alloc.find_reset_run(j, ams.grains, 1) {
        let (base, limit) = (seg_base + (lo << align_shift), seg_base + (hi << align_shift));
        for addr in base..limit {
            // SAFETY: the segment is exposed and [base, limit) is free
            // storage the pool owns.
            let byte = unsafe { *(addr as *const u8) };
            assert_eq!(byte, pattern, "freed storage overwritten at {addr:#x}");
        }
        j = hi + 1;
        if j >= ams.grains {
            break;
        }
    }
}

pub(crate) fn seg_blacken(inner: &mut ArenaInner, sid: SegId, traces: TraceSet) {
    // Colour tables exist only on white segments; for others the caller's
    // removal of segment-level greyness is all there is to do.
    if inner.seg(sid).white.inter(traces).is_empty() {
        return;
    }
    let ams = inner.seg_mut(sid).payload.as_ams_mut();
    if !ams.colour_tables_in_use {
        return;
    }
    let grains = ams.grains;
    let mut j = 0;
    while let Some(i) = ams.find_grey(j, grains) {
        ams.scanned.set(i);
        j = i + 1;
    }
    ams.marks_changed = false;
}

pub(crate) fn seg_scan(inner: &mut ArenaInner, sid: SegId, ss: &mut ScanState) -> Result<bool> {
    let scan_all = {
        let seg = inner.seg(sid);
        // If the segment is not white for some scanned trace, the whole
        // segment (except the buffer) is grey for it.
        !ss.traces.diff(seg.white).is_empty()
    };

    if scan_all {
        iterate_objects(inner, sid, |inner, _i, p, next| {
            scan_object(inner, ss, sid, p, next)
        })?;
        return Ok(true);
    }

    let (seg_base, pid) = {
        let s = inner.seg(sid);
        (s.base, s.pool)
    };
    let format = inner.pool(pid).format;
    let align_shift = inner.pool(pid).align_shift;
    debug_assert!(inner.seg(sid).payload.as_ams().colour_tables_in_use);

    loop {
        inner.seg_mut(sid).payload.as_ams_mut().marks_changed = false;
        if inner.seg(sid).payload.as_ams().ambiguous_fixes {
            // Grey runs are unreliable after an ambiguous fix; pay for a
            // full pass over the segment.
            iterate_objects(inner, sid, |inner, i, p, next| {
                if !inner.seg(sid).payload.as_ams().is_grey(i) {
                    return Ok(());
                }
                scan_object(inner, ss, sid, p, next)?;
                let j = (next - seg_base) >> align_shift;
                grey_blacken(inner, sid, i, j);
                Ok(())
            })?;
        } else {
            let mut j = 0;
            loop {
                let grains = inner.seg(sid).payload.as_ams().grains;
                let Some(i) = inner.seg(sid).payload.as_ams().find_grey(j, grains) else {
                    break;
                };
                let p = seg_base + (i << align_shift);
                let client = p + format.header_size;
                // SAFETY: the trace engine exposed the segment.
                let next = (format.skip)(client) - format.header_size;
                j = (next - seg_base) >> align_shift;
                scan_object(inner, ss, sid, p, next)?;
                debug_assert!(!inner.seg(sid).payload.as_ams().ambiguous_fixes);
                grey_blacken(inner, sid, i, j);
            }
        }
        if !inner.seg(sid).payload.as_ams().marks_changed {
            break;
        }
    }
    Ok(false)
}

fn scan_object(
    inner: &mut ArenaInner,
    ss: &mut ScanState,
    sid: SegId,
    p: Addr,
    next: Addr,
) -> Result<()> {
    let format = inner.pool(inner.seg(sid).pool).format;
    let (base, limit) = (p + format.header_size, next + format.header_size);
    let mut ctx = ScanCtx { inner, ss };
    ctx.note_area(base, limit);
    (format.scan)(&mut ctx, base, limit)
}

/// Blacken the object spanning grains [i, j): head grey to black, tail
/// white to black.
fn grey_blacken(inner: &mut ArenaInner, sid: SegId, i: usize, j: usize) {
    let ams = inner.seg_mut(sid).payload.as_ams_mut();
    ams.scanned.set(i);
    if i + 1 < j {
        ams.mark.set_range(i + 1, j);
        ams.scanned.set_range(i + 1, j);
    }
}

pub(crate) fn seg_fix(
    inner: &mut ArenaInner,
    sid: SegId,
    ss: &mut ScanState,
    ref_io: &mut Addr,
) -> Result<()> {
    let (seg_base, seg_limit, pid, rank_set) = {
        let s = inner.seg(sid);
        (s.base, s.limit, s.pool, s.rank_set)
    };
    let format = inner.pool(pid).format;
    let align = inner.pool(pid).align;
    let support_ambiguous = match &inner.pool(pid).class {
        PoolClass::Ams(p) => p.support_ambiguous,
        _ => unreachable!("AMS fix on non-AMS pool"),
    };

    let client = *ref_io;
    debug_assert!(client >= seg_base && client < seg_limit);
    // An ambiguous value near the segment base can land inside the header
    // area once the header is subtracted; that is not a reference.
    if client < seg_base + format.header_size {
        debug_assert_eq!(ss.rank, Rank::Ambig);
        return Ok(());
    }
    let base = client - format.header_size;
    if !arith::is_aligned(base - seg_base, align) {
        debug_assert_eq!(ss.rank, Rank::Ambig);
        return Ok(());
    }
    let i = (base - seg_base) >> inner.pool(pid).align_shift;
    if !inner.seg(sid).payload.as_ams().alloced(i) {
        debug_assert_eq!(ss.rank, Rank::Ambig);
        return Ok(());
    }

    if ss.rank == Rank::Ambig {
        if !support_ambiguous {
            return Ok(());
        }
        inner.seg_mut(sid).payload.as_ams_mut().ambiguous_fixes = true;
    }

    if !inner.seg(sid).payload.as_ams().is_white(i) {
        return Ok(());
    }
    ss.was_marked = false;

    if ss.rank == Rank::Weak {
        // Weak splat: a dead target zeroes the reference; no marking.
        *ref_io = 0;
        return Ok(());
    }

    ss.preserved_in_place_count += 1;
    if rank_set.is_empty() && ss.rank != Rank::Ambig {
        // The segment holds no references, so the object needs no scan;
        // take it straight to black.
        shield::expose(inner, sid);
        // SAFETY: exposed above; skip parses the live object.
        let next = (format.skip)(client) - format.header_size;
        shield::cover(inner, sid);
        let j = (next - seg_base) >> inner.pool(pid).align_shift;
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        ams.mark.set_range(i, j);
        ams.scanned.set_range(i, j);
    } else {
        {
            let ams = inner.seg_mut(sid).payload.as_ams_mut();
            ams.mark.set(i);
            ams.marks_changed = true;
        }
        let mut grey = inner.seg(sid).grey;
        for ti in ss.traces.iter() {
            grey = grey.add(ti);
        }
        seg::set_grey(inner, sid, grey);
    }
    Ok(())
}

pub(crate) fn seg_reclaim(inner: &mut ArenaInner, sid: SegId, trace: TraceId) {
    let pid = inner.seg(sid).pool;
    let seg_base = inner.seg(sid).base;
    let align_shift = inner.pool(pid).align_shift;
    let debug = debug_options(inner, sid);

    // Collect the white runs first, then splat and free them.
    let white_runs = {
        let ams = inner.seg(sid).payload.as_ams();
        debug_assert!(ams.colour_tables_in_use);
        debug_assert!(!ams.marks_changed, "grey objects at reclaim");
        let mut runs = Vec::new();
        let mut i = 0;
        while i < ams.grains {
            if !ams.is_white(i) {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < ams.grains && ams.is_white(j) {
                j += 1;
            }
            runs.push((i, j));
            i = j;
        }
        runs
    };

    let mut reclaimed = 0;
    if !white_runs.is_empty() {
        if let Some(debug) = debug {
            let mut guard = shield::Exposed::new(inner, sid);
            let inner = guard.inner();
            for &(i, j) in &white_runs {
                let base = seg_base + (i << align_shift);
                let limit = seg_base + (j << align_shift);
                // SAFETY: exposed; the run is dead storage being splatted.
                unsafe {
                    std::ptr::write_bytes(base as *mut u8, debug.splat_pattern, limit - base);
                }
            }
        }
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        for &(i, j) in &white_runs {
            ams.alloc.reset_range(i, j);
            reclaimed += j - i;
        }
    }

    let (free_grains, grains) = {
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        debug_assert!(ams.old_grains >= reclaimed);
        ams.old_grains -= reclaimed;
        ams.free_grains += reclaimed;
        ams.colour_tables_in_use = false;
        ams.check();
        (ams.free_grains, ams.grains)
    };
    let has_buffer = inner.seg(sid).buffer.is_some();

    let bytes = inner.pool(pid).grains_size(reclaimed);
    inner.pool_mut(pid).gen.account_reclaim(bytes);
    inner.trace_mut(trace).reclaim_size += bytes;

    {
        let seg = inner.seg_mut(sid);
        seg.white = seg.white.del(trace);
    }

    if free_grains == grains && !has_buffer {
        // No survivors; the whole segment goes back to the arena.
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
    let mut guard = shield::Exposed::new(inner, sid);
    let inner = guard.inner();
    let _ = iterate_objects(inner, sid, |inner, i, p, _next| {
        let ams = inner.seg(sid).payload.as_ams();
        if !ams.colour_tables_in_use || !ams.is_white(i) {
            visitor(p + header, pid);
        }
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Merge and split
// ---------------------------------------------------------------------------

fn mergeable(inner: &ArenaInner, sid: SegId) -> bool {
    let s = inner.seg(sid);
    s.buffer.is_none()
        && s.white.is_empty()
        && s.grey.is_empty()
        && !s.payload.as_ams().colour_tables_in_use
}

fn copy_bits(dst: &mut BitTable, dst_at: usize, src: &BitTable, lo: usize, hi: usize) {
    for i in lo..hi {
        if src.get(i) {
            dst.set(dst_at + i - lo);
        }
    }
}

/// Merge two adjacent segments of the same AMS pool.
pub(crate) fn seg_merge(inner: &mut ArenaInner, lo: SegId, hi: SegId) -> Result<()> {
    {
        let (a, b) = (inner.seg(lo), inner.seg(hi));
        if a.pool != b.pool || a.limit != b.base {
            return Err(GcError::Param);
        }
    }
    if !mergeable(inner, lo) || !mergeable(inner, hi) {
        return Err(GcError::Fail);
    }
    inner.seg_mut(lo).payload.as_ams_mut().materialize_alloc();
    inner.seg_mut(hi).payload.as_ams_mut().materialize_alloc();

    let hi_seg = inner.take_seg_for_merge(hi);
    let hi_ams = hi_seg.payload.as_ams();
    let seg = inner.seg_mut(lo);
    let ams = seg.payload.as_ams_mut();
    let lo_grains = ams.grains;
    let all = lo_grains + hi_ams.grains;

    let mut alloc = BitTable::new(all);
    let mut mark = BitTable::new(all);
    let mut scanned = BitTable::new(all);
    copy_bits(&mut alloc, 0, &ams.alloc, 0, lo_grains);
    copy_bits(&mut mark, 0, &ams.mark, 0, lo_grains);
    copy_bits(&mut scanned, 0, &ams.scanned, 0, lo_grains);
    copy_bits(&mut alloc, lo_grains, &hi_ams.alloc, 0, hi_ams.grains);
    copy_bits(&mut mark, lo_grains, &hi_ams.mark, 0, hi_ams.grains);
    copy_bits(&mut scanned, lo_grains, &hi_ams.scanned, 0, hi_ams.grains);

    ams.grains = all;
    ams.alloc = alloc;
    ams.mark = mark;
    ams.scanned = scanned;
    ams.first_free = all;
    ams.free_grains += hi_ams.free_grains;
    ams.new_grains += hi_ams.new_grains;
    ams.old_grains += hi_ams.old_grains;
    debug_assert_eq!(hi_ams.buffered_grains, 0);
    ams.check();
    seg.limit = hi_seg.limit;
    Ok(())
}

/// Split a segment at `at` (grain-aligned, strictly inside the segment).
pub(crate) fn seg_split(inner: &mut ArenaInner, sid: SegId, at: Addr) -> Result<SegId> {
    {
        let seg = inner.seg(sid);
        if at <= seg.base || at >= seg.limit || !arith::is_aligned(at - seg.base, inner.grain_size)
        {
            return Err(GcError::Param);
        }
    }
    if !mergeable(inner, sid) {
        return Err(GcError::Fail);
    }
    inner.seg_mut(sid).payload.as_ams_mut().materialize_alloc();

    let (pid, seg_base, seg_limit, rank_set) = {
        let s = inner.seg(sid);
        (s.pool, s.base, s.limit, s.rank_set)
    };
    let k = inner.pool(pid).index_of_addr(seg_base, at);

    let hi_payload = {
        let ams = inner.seg_mut(sid).payload.as_ams_mut();
        let grains = ams.grains;
        let mut hi = AmsSeg::new(grains - k);
        hi.materialize_alloc();
        copy_bits(&mut hi.alloc, 0, &ams.alloc, k, grains);
        copy_bits(&mut hi.mark, 0, &ams.mark, k, grains);
        copy_bits(&mut hi.scanned, 0, &ams.scanned, k, grains);
        hi.free_grains = hi.alloc.count_reset_range(0, grains - k);
        hi.new_grains = (grains - k) - hi.free_grains;
        hi.old_grains = 0;

        let mut lo_alloc = BitTable::new(k);
        let mut lo_mark = BitTable::new(k);
        let mut lo_scanned = BitTable::new(k);
        copy_bits(&mut lo_alloc, 0, &ams.alloc, 0, k);
        copy_bits(&mut lo_mark, 0, &ams.mark, 0, k);
        copy_bits(&mut lo_scanned, 0, &ams.scanned, 0, k);
        ams.grains = k;
        ams.alloc = lo_alloc;
        ams.mark = lo_mark;
        ams.scanned = lo_scanned;
        ams.first_free = k;
        ams.free_grains = ams.alloc.count_reset_range(0, k);
        ams.new_grains = k - ams.free_grains;
        ams.old_grains = 0;
        ams.buffered_grains = 0;
        SegPayload::Ams(hi)
    };
    inner.seg_mut(sid).limit = at;

    let hi_sid = inner.adopt_split_seg(pid, at, seg_limit, hi_payload);
    seg::set_rank_set(inner, hi_sid, rank_set);
    events::seg_alloc(at, seg_limit - at, pid.0);
    Ok(hi_sid)
}
