//! Walkers: formatted-object and root iteration for client inspection.
//!
//! All walkers require a parked arena with no collection in progress. The
//! roots walk synthesizes a minimal trace with a universal white set so
//! every root reference reaches the fix path, where it is reported to the
//! client instead of being marked; segment colors are restored afterwards.

use crate::arena::{ArenaInner, CollectReason};
use crate::arith::Addr;
use crate::error::{GcError, Result};
use crate::pool::{self, PoolId};
use crate::root::RootId;
use crate::seg::Rank;
use crate::shield;
use crate::trace::{self, ScanCtx, ScanState, TraceSet, TraceState};
use crate::zone::ZoneSet;

/// Area callback for [`pool_walk`]: like a format scanner, but fixing is a
/// no-op because the white zone set is empty.
pub type AreaWalkFn = fn(&mut ScanCtx<'_>, Addr, Addr, usize) -> Result<()>;

fn require_parked(inner: &ArenaInner) -> Result<()> {
    if !inner.parked || !inner.busy.is_empty() {
        return Err(GcError::Fail);
    }
    Ok(())
}

/// Visit every formatted object of every pool.
pub(crate) fn formatted_objects_walk(
    inner: &mut ArenaInner,
    visitor: &mut dyn FnMut(Addr, PoolId),
) -> Result<()> {
    require_parked(inner)?;
    for sid in inner.seg_ids() {
        pool::seg_walk(inner, sid, visitor);
    }
    Ok(())
}

/// Walk the formatted areas of one pool through an area-scan callback.
pub(crate) fn pool_walk(
    inner: &mut ArenaInner,
    pid: PoolId,
    area: AreaWalkFn,
    closure: usize,
) -> Result<()> {
    require_parked(inner)?;
    if !inner.pools.contains(pid.0) {
        return Err(GcError::Param);
    }

    let skip = inner.pool(pid).format.skip;
    for sid in inner.pool(pid).segs.clone() {
        // Collect object areas under exposure, then hand them to the
        // client with a scanner whose white set is empty.
        let mut areas: Vec<(Addr, Addr)> = Vec::new();
        {
            let mut guard = shield::Exposed::new(inner, sid);
            let inner = guard.inner();
            pool::seg_walk(inner, sid, &mut |client, _pid| {
                // SAFETY: the segment is exposed for the whole collection
                // pass; skip parses the visited object.
                let next = skip(client);
                areas.push((client, next));
            });
        }
        let mut ss = ScanState::new(TraceSet::EMPTY, Rank::Exact, ZoneSet::EMPTY);
        let mut guard = shield::Exposed::new(inner, sid);
        let inner = guard.inner();
        for (base, limit) in areas {
            let mut ctx = ScanCtx {
                inner: &mut *inner,
                ss: &mut ss,
            };
            area(&mut ctx, base, limit, closure)?;
        }
    }
    Ok(())
}

/// Walk every reference in every root, without mutating the graph or any
/// segment's color state.
pub(crate) fn roots_walk(
    inner: &mut ArenaInner,
    f: &mut dyn FnMut(Addr, RootId),
) -> Result<()> {
    require_parked(inner)?;

    let ti = trace::create(inner, CollectReason::Walk)?;

    // First stage of fixing tests the white zone set, and the second stage
    // tests segment whiteness; make both universal so every root reference
    // reaches the reporting hook.
    inner.trace_mut(ti).white = ZoneSet::UNIV;
    let seg_ids = inner.seg_ids();
    for &sid in &seg_ids {
        let seg = inner.seg_mut(sid);
        seg.white = seg.white.add(ti);
    }
    for rid in inner.roots.ids().collect::<Vec<_>>() {
        crate::root::grey(inner, RootId(rid), ti);
    }
    inner.flipped = inner.flipped.add(ti);

    let mut result = Ok(());
    for rank in Rank::ALL {
        for rid in inner.roots.ids().collect::<Vec<_>>() {
            let rid = RootId(rid);
            if inner.roots.get(rid.0).expect("root just listed").rank != rank {
                continue;
            }
            let mut hook = |r: &mut Addr| f(*r, rid);
            let hook_ptr: *mut (dyn FnMut(&mut Addr) + '_) = &mut hook;
            let mut ss = ScanState::new(TraceSet::single(ti), rank, ZoneSet::UNIV);
            // SAFETY: the erased borrow outlives the scan below, and the
            // scan state does not escape this iteration.
            ss.walk = Some(unsafe {
                std::mem::transmute::<
                    *mut (dyn FnMut(&mut Addr) + '_),
                    *mut (dyn FnMut(&mut Addr) + 'static),
                >(hook_ptr)
            });
            result = crate::root::scan(inner, &mut ss, rid);
            if result.is_err() {
                break;
            }
        }
        if result.is_err() {
            break;
        }
    }

    // Restore colors: only segment whiteness was touched.
    for &sid in &seg_ids {
        let seg = inner.seg_mut(sid);
        seg.white = seg.white.del(ti);
    }
    inner.trace_mut(ti).state = TraceState::Finished;
    trace::destroy_finished(inner, ti);
    debug_assert!(!inner.emergency, "roots walk must not allocate");
    result
}
