//! SNC: stack-no-check pool class.
//!
//! A stack allocator over a chain of segments, newest on top. Storage is
//! reclaimed only by popping lightweight allocation frames; the collector
//! never condemns SNC storage, though it scans it for references into
//! condemned pools. Freed segments are padded whole, stripped of their
//! rank set, and kept on a pool-local free list for reuse.

use crate::arena::ArenaInner;
use crate::arith::{self, Addr};
use crate::buffer::{self, ApId};
use crate::error::{GcError, Result};
use crate::format::Format;
use crate::pool::{Pool, PoolClass, PoolGen, PoolId};
use crate::seg::{self, RankSet, SegId, SegPayload};
use crate::trace::{ScanCtx, ScanState};
use crate::zone::ZoneSet;

/// Configuration for an SNC pool.
#[derive(Debug, Clone, Copy)]
pub struct SncOptions {
    pub(crate) format: Format,
    pub(crate) extend_by: usize,
}

impl SncOptions {
    /// Options for an SNC pool with the given format.
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            extend_by: 4096,
        }
    }

    /// Preferred segment size.
    #[must_use]
    pub fn extend_by(mut self, bytes: usize) -> Self {
        self.extend_by = bytes;
        self
    }
}

pub(crate) struct SncPool {
    /// Free list of reusable segments, threaded through payload links.
    pub(crate) free_head: Option<SegId>,
}

/// Per-segment SNC state: the link in a buffer chain or the free list.
pub(crate) struct SncSeg {
    pub(crate) next: Option<SegId>,
}

pub(crate) fn make_pool(options: &SncOptions) -> Pool {
    let align = options.format.align.max(std::mem::size_of::<usize>());
    Pool {
        class: PoolClass::Snc(SncPool { free_head: None }),
        format: options.format,
        align,
        align_shift: align.trailing_zeros(),
        extend_by: options.extend_by.max(align),
        segs: Vec::new(),
        gen: PoolGen::default(),
    }
}

fn snc_pool_mut(inner: &mut ArenaInner, pid: PoolId) -> &mut SncPool {
    match &mut inner.pool_mut(pid).class {
        PoolClass::Snc(p) => p,
        _ => unreachable!("SNC operation on non-SNC pool"),
    }
}

fn snc_pool(inner: &ArenaInner, pid: PoolId) -> &SncPool {
    match &inner.pool(pid).class {
        PoolClass::Snc(p) => p,
        _ => unreachable!("SNC operation on non-SNC pool"),
    }
}

/// Pop a first-fit segment from the pool free list.
fn find_free_seg(inner: &mut ArenaInner, pid: PoolId, size: usize) -> Option<SegId> {
    let mut prev: Option<SegId> = None;
    let mut cursor = snc_pool(inner, pid).free_head;
    while let Some(sid) = cursor {
        let next = inner.seg(sid).payload.as_snc().next;
        if inner.seg(sid).size() >= size {
            match prev {
                None => snc_pool_mut(inner, pid).free_head = next,
                Some(p) => inner.seg_mut(p).payload.as_snc_mut().next = next,
            }
            inner.seg_mut(sid).payload.as_snc_mut().next = None;
            return Some(sid);
        }
        prev = Some(sid);
        cursor = next;
    }
    None
}

/// Pad a freed segment whole, clear its rank set, and put it on the free
/// list. Rankless segments are invisible to tracing and walking.
fn record_free_seg(inner: &mut ArenaInner, pid: PoolId, sid: SegId) {
    debug_assert!(inner.seg(sid).white.is_empty());
    seg::set_grey(inner, sid, crate::trace::TraceSet::EMPTY);
    seg::set_rank_set(inner, sid, RankSet::empty());
    seg::set_summary(inner, sid, ZoneSet::EMPTY);

    let (base, size, pad) = {
        let s = inner.seg(sid);
        (s.base, s.size(), inner.pool(pid).format.pad)
    };
    {
        let mut guard = crate::shield::Exposed::new(inner, sid);
        let _inner = guard.inner();
        pad(base, size);
    }

    {
        let head = snc_pool(inner, pid).free_head;
        inner.seg_mut(sid).payload.as_snc_mut().next = head;
        snc_pool_mut(inner, pid).free_head = Some(sid);
    }
    // Whole-segment accounting: chain storage is new, free-list storage
    // is free.
    let gen = &mut inner.pool_mut(pid).gen;
    debug_assert!(gen.new_size >= size);
    gen.new_size -= size;
    gen.free_size += size;
}

// ---------------------------------------------------------------------------
// Buffers and frames
// ---------------------------------------------------------------------------

pub(crate) fn buffer_fill(inner: &mut ArenaInner, ap: ApId, size: usize) -> Result<Addr> {
    if let Some(sid) = inner.ap(ap).seg {
        buffer_empty(inner, ap, sid);
    }

    let (pid, rank) = {
        let a = inner.ap(ap);
        (a.pool, a.rank)
    };
    let size = arith::align_up(size, inner.pool(pid).align);

    let sid = match find_free_seg(inner, pid, size) {
        Some(sid) => {
            let bytes = inner.seg(sid).size();
            let gen = &mut inner.pool_mut(pid).gen;
            debug_assert!(gen.free_size >= bytes);
            gen.free_size -= bytes;
            gen.buffered_size += bytes;
            sid
        }
        None => {
            let bytes = {
                let pool = inner.pool(pid);
                arith::align_up(size.max(pool.extend_by), inner.grain_size)
            };
            let sid = inner.place_seg(pid, bytes, SegPayload::Snc(SncSeg { next: None }))?;
            let gen = &mut inner.pool_mut(pid).gen;
            debug_assert!(gen.free_size >= bytes);
            gen.free_size -= bytes;
            gen.buffered_size += bytes;
            sid
        }
    };
    seg::set_rank_set(inner, sid, rank.to_set());

    // Push onto the buffer chain, newest on top.
    {
        let top = inner.ap(ap).snc_chain;
        inner.seg_mut(sid).payload.as_snc_mut().next = top;
        inner.ap_mut(ap).snc_chain = Some(sid);
    }

    let (base, limit) = {
        let s = inner.seg(sid);
        (s.base, s.limit)
    };
    buffer::attach(inner, ap, sid, base, limit);
    Ok(base)
}

pub(crate) fn buffer_empty(inner: &mut ArenaInner, ap: ApId, sid: SegId) {
    let (sid2, _base, init, limit) = buffer::take_range(inner, ap);
    debug_assert_eq!(sid.0, sid2.0);
    let pid = inner.seg(sid).pool;
    if init < limit {
        // Pad the unused suffix so the segment stays parseable.
        let pad = inner.pool(pid).format.pad;
        let mut guard = crate::shield::Exposed::new(inner, sid);
        let _inner = guard.inner();
        pad(init, limit - init);
    }
    // The whole segment moves from buffered to chain (new) storage; the
    // segment itself stays on the allocation chain.
    let size = inner.seg(sid).size();
    let gen = &mut inner.pool_mut(pid).gen;
    debug_assert!(gen.buffered_size >= size);
    gen.buffered_size -= size;
    gen.new_size += size;
}

/// Free chain segments above `up_to` (exclusive); `None` frees the whole
/// chain.
fn pop_chain(inner: &mut ArenaInner, ap: ApId, up_to: Option<SegId>) {
    let pid = inner.ap(ap).pool;
    loop {
        let top = inner.ap(ap).snc_chain;
        let Some(sid) = top else {
            debug_assert!(up_to.is_none(), "pop target not in the chain");
            return;
        };
        if Some(sid) == up_to {
            return;
        }
        let next = inner.seg(sid).payload.as_snc().next;
        inner.ap_mut(ap).snc_chain = next;
        record_free_seg(inner, pid, sid);
    }
}

pub(crate) fn frame_push(inner: &mut ArenaInner, ap: ApId) -> Result<Option<Addr>> {
    if inner.ap(ap).seg.is_none() {
        if inner.ap(ap).snc_chain.is_none() {
            // Empty stack: the distinguished bottom marker.
            return Ok(None);
        }
        // Detached but non-empty: refill so the marker lands in a segment.
        let align = inner.pool(inner.ap(ap).pool).align;
        let base = buffer_fill(inner, ap, align)?;
        return Ok(Some(base));
    }
    let sid = inner.ap(ap).seg.expect("attached");
    let init = inner.ap(ap).shared.init_addr();
    if init < inner.seg(sid).limit {
        return Ok(Some(init));
    }
    // The initialized mark sits at the segment limit, which is not an
    // address in the segment; refill and mark the fresh base.
    let align = inner.pool(inner.ap(ap).pool).align;
    let base = buffer_fill(inner, ap, align)?;
    Ok(Some(base))
}

pub(crate) fn frame_pop(inner: &mut ArenaInner, ap: ApId, frame: Option<Addr>) -> Result<()> {
    let pid = inner.ap(ap).pool;
    let Some(addr) = frame else {
        // Pop to bottom of stack.
        if inner.ap(ap).seg.is_some() {
            let sid = inner.ap(ap).seg.expect("attached");
            buffer_empty(inner, ap, sid);
        }
        pop_chain(inner, ap, None);
        return Ok(());
    };

    let Some(sid) = inner.seg_of_addr(addr) else {
        return Err(GcError::Param);
    };
    if inner.seg(sid).pool != pid {
        return Err(GcError::Param);
    }

    if inner.ap(ap).seg == Some(sid) {
        // Same segment: only the window moves.
        let shared = &inner.ap(ap).shared;
        debug_assert!(addr <= shared.init_addr(), "frame pop must move down");
        shared
            .alloc
            .store(addr, std::sync::atomic::Ordering::Relaxed);
        shared
            .init
            .store(addr, std::sync::atomic::Ordering::Release);
        return Ok(());
    }

    // The target lies below the top segment: detach, free everything above
    // it, and re-attach with the window at the frame.
    if inner.ap(ap).seg.is_some() {
        let top = inner.ap(ap).seg.expect("attached");
        buffer_empty(inner, ap, top);
    }
    if !chain_contains(inner, ap, sid) {
        return Err(GcError::Param);
    }
    pop_chain(inner, ap, Some(sid));

    let (base, limit, size) = {
        let s = inner.seg(sid);
        (s.base, s.limit, s.size())
    };
    // The segment re-enters buffered accounting from chain storage.
    {
        let gen = &mut inner.pool_mut(pid).gen;
        debug_assert!(gen.new_size >= size);
        gen.new_size -= size;
        gen.buffered_size += size;
    }
    buffer::attach(inner, ap, sid, base, limit);
    let shared = &inner.ap(ap).shared;
    shared
        .alloc
        .store(addr, std::sync::atomic::Ordering::Relaxed);
    shared
        .init
        .store(addr, std::sync::atomic::Ordering::Release);
    Ok(())
}

fn chain_contains(inner: &ArenaInner, ap: ApId, sid: SegId) -> bool {
    let mut cursor = inner.ap(ap).snc_chain;
    while let Some(cur) = cursor {
        if cur == sid {
            return true;
        }
        cursor = inner.seg(cur).payload.as_snc().next;
    }
    false
}

// ---------------------------------------------------------------------------
// Tracing operations
// ---------------------------------------------------------------------------

/// Scan the initialized prefix of the segment.
pub(crate) fn seg_scan(inner: &mut ArenaInner, sid: SegId, ss: &mut ScanState) -> Result<bool> {
    let (seg_base, seg_limit, pid) = {
        let s = inner.seg(sid);
        (s.base, s.limit, s.pool)
    };
    let format = inner.pool(pid).format;
    let scan_l = buffer::scan_limit(inner, sid);
    if scan_l > seg_base {
        let (base, limit) = (seg_base + format.header_size, scan_l + format.header_size);
        let mut ctx = ScanCtx { inner, ss };
        ctx.note_area(base, limit);
        (format.scan)(&mut ctx, base, limit)?;
    }
    Ok(scan_l == seg_limit)
}

/// Visit the initialized objects. Free-listed (rankless) segments hold
/// only padding and are skipped; grey segments are skipped because their
/// objects may still hold references to condemned storage.
pub(crate) fn seg_walk(
    inner: &mut ArenaInner,
    sid: SegId,
    visitor: &mut dyn FnMut(Addr, PoolId),
) {
    if inner.seg(sid).rank_set.is_empty() || !inner.seg(sid).grey.is_empty() {
        return;
    }
    let (seg_base, pid) = {
        let s = inner.seg(sid);
        (s.base, s.pool)
    };
    let format = inner.pool(pid).format;
    let scan_l = buffer::scan_limit(inner, sid);

    let mut guard = crate::shield::Exposed::new(inner, sid);
    let _inner = guard.inner();
    let mut object = seg_base + format.header_size;
    let limit = scan_l + format.header_size;
    while object < limit {
        visitor(object, pid);
        // SAFETY: exposed above; skip parses objects and padding.
        let next = (format.skip)(object);
        debug_assert!(next > object);
        object = next;
    }
}
