//! The trace engine: collection cycles.
//!
//! A trace condemns a set of segments (turning them white), flips the
//! mutator to black by scanning roots, then scans grey segments band by
//! band until no grey remains, and finally reclaims whatever stayed white.
//! Work is chunked by a per-trace quantum so most of it happens
//! incrementally on mutator polls.
//!
//! Fixing a candidate reference has three stages: a zone test against the
//! union of the scanned traces' white sets, a segment lookup, and the
//! owning pool's `fix` operation. Only references that reach the third
//! stage can mark, grey, or splat anything.

use crate::arena::{ArenaInner, CollectReason};
use crate::arith::{self, Addr, WORD_WIDTH};
use crate::buffer;
use crate::error::{GcError, Result};
use crate::events::{self, TraceSerial};
use crate::message::Message;
use crate::pool::{self, ChainId};
use crate::root::RootId;
use crate::seg::{self, AccessSet, Rank, RankSet, SegId, WB_DEFER_DELAY, WB_DEFER_HIT};
use crate::shield;
use crate::zone::ZoneSet;

/// Maximum number of concurrently busy traces per arena.
pub(crate) const TRACE_MAX: usize = 4;

/// Number of polls a collection is budgeted to complete within.
const FINISHING_POLLS: f64 = 65536.0;

/// Index of a trace within the arena's busy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TraceId(pub(crate) u8);

/// A small set of trace indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TraceSet(pub(crate) u8);

impl TraceSet {
    pub(crate) const EMPTY: Self = Self(0);

    pub(crate) fn single(trace: TraceId) -> Self {
        Self(1 << trace.0)
    }

    #[must_use]
    pub(crate) fn add(self, trace: TraceId) -> Self {
        Self(self.0 | 1 << trace.0)
    }

    #[must_use]
    pub(crate) fn del(self, trace: TraceId) -> Self {
        Self(self.0 & !(1 << trace.0))
    }

    pub(crate) fn contains(self, trace: TraceId) -> bool {
        self.0 & 1 << trace.0 != 0
    }

    #[must_use]
    pub(crate) fn inter(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub(crate) fn diff(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn first(self) -> Option<TraceId> {
        (self.0 != 0).then(|| TraceId(self.0.trailing_zeros() as u8))
    }

    pub(crate) fn iter(self) -> impl Iterator<Item = TraceId> {
        (0..TRACE_MAX as u8).filter_map(move |i| self.contains(TraceId(i)).then_some(TraceId(i)))
    }
}

impl Default for TraceSet {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Lifecycle of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceState {
    /// Created; condemn set being chosen.
    Init,
    /// Condemn set chosen; mutator not yet flipped.
    Unflipped,
    /// Mutator is black; scanning towards the grey fixed point.
    Flipped,
    /// No grey remains; white storage being recovered.
    Reclaim,
    /// Complete; awaiting destruction.
    Finished,
}

/// The generations a trace condemns.
#[derive(Debug, Clone, Default)]
pub(crate) struct CondemnSet {
    /// (chain, generation) pairs, leaves first.
    pub(crate) gens: Vec<(ChainId, usize)>,
    /// Whether pools outside any chain (the arena's top generation) are
    /// condemned too.
    pub(crate) top: bool,
}

/// One collection cycle.
pub(crate) struct Trace {
    pub(crate) id: TraceId,
    pub(crate) serial: TraceSerial,
    pub(crate) why: CollectReason,
    pub(crate) state: TraceState,
    /// Current scanning band, as a rank index; may run one past `Weak`
    /// transiently while advancing.
    pub(crate) band: u8,
    pub(crate) first_stretch: bool,
    /// Zone approximation of the condemned set.
    pub(crate) white: ZoneSet,
    pub(crate) condemn: CondemnSet,
    pub(crate) condemned: usize,
    pub(crate) not_condemned: usize,
    /// Bytes of segments grey at the flip.
    pub(crate) foundation: usize,
    /// Scanning work per poll, in bytes.
    pub(crate) quantum_work: usize,
    pub(crate) root_scan_size: usize,
    pub(crate) seg_scan_size: usize,
    pub(crate) reclaim_size: usize,
    pub(crate) preserved_in_place_size: usize,
    pub(crate) preserved_in_place_count: usize,
    pub(crate) read_barrier_hits: usize,
    pub(crate) pointless_scans: usize,
    /// Barrier-provoked single-reference scans this cycle.
    pub(crate) single_scans: usize,
}

impl Trace {
    /// A measure of the scanning work done so far.
    pub(crate) fn work(&self) -> usize {
        self.root_scan_size + self.seg_scan_size
    }
}

/// Why counts from a scan state are being folded into traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccountingPhase {
    RootScan,
    SegScan,
    SingleScan,
}

/// Ephemeral record of one scan pass.
pub(crate) struct ScanState {
    /// Traces this scan serves.
    pub(crate) traces: TraceSet,
    /// Rank the references are being scanned at.
    pub(crate) rank: Rank,
    /// Union of the white zone sets of `traces`.
    pub(crate) white: ZoneSet,
    /// Zones of all references seen, before fixing.
    pub(crate) unfixed: ZoneSet,
    /// Zones of references after fixing.
    pub(crate) fixed: ZoneSet,
    pub(crate) scanned_size: usize,
    pub(crate) fix_ref_count: usize,
    pub(crate) seg_ref_count: usize,
    pub(crate) white_seg_ref_count: usize,
    pub(crate) preserved_in_place_count: usize,
    /// Set by pool fix: whether the target was already marked.
    pub(crate) was_marked: bool,
    /// Roots-walk hook: when set, white references are reported to the
    /// client instead of being fixed. Raw (with the borrow erased) to keep
    /// `ScanState` free of lifetimes; valid strictly for the duration of
    /// the walk that set it.
    pub(crate) walk: Option<*mut (dyn FnMut(&mut Addr) + 'static)>,
}

impl ScanState {
    pub(crate) fn new(traces: TraceSet, rank: Rank, white: ZoneSet) -> Self {
        Self {
            traces,
            rank,
            white,
            unfixed: ZoneSet::EMPTY,
            fixed: ZoneSet::EMPTY,
            scanned_size: 0,
            fix_ref_count: 0,
            seg_ref_count: 0,
            white_seg_ref_count: 0,
            preserved_in_place_count: 0,
            was_marked: true,
            walk: None,
        }
    }

    /// Summary of the references scanned: everything seen, minus the white
    /// set (those went through fix), plus everything after fixing.
    pub(crate) fn summary(&self) -> ZoneSet {
        self.fixed.union(self.unfixed.diff(self.white))
    }
}

/// The scanning context handed to format area scanners and root callbacks.
pub struct ScanCtx<'a> {
    pub(crate) inner: &'a mut ArenaInner,
    pub(crate) ss: &'a mut ScanState,
}

impl ScanCtx<'_> {
    /// Fix one candidate reference.
    ///
    /// The referent may be marked or greyed; for weak scanning of a dead
    /// target the reference is set to zero in place. The caller must store
    /// the possibly-updated value back into the scanned slot.
    ///
    /// # Errors
    ///
    /// Propagates pool fix failures; on error the reference is unchanged.
    pub fn fix(&mut self, ref_io: &mut Addr) -> Result<()> {
        let r = *ref_io;
        let shift = self.inner.zone_shift;
        self.ss.unfixed = self.ss.unfixed.add(r, shift);

        // First stage: zone test against the union of white sets.
        if !self.ss.white.contains(r, shift) {
            return Ok(());
        }
        self.ss.fix_ref_count += 1;

        // Second stage: locate the segment.
        let Some(sid) = self.inner.seg_of_addr(r) else {
            self.ss.fixed = self.ss.fixed.add(r, shift);
            return Ok(());
        };
        self.ss.seg_ref_count += 1;
        if self.inner.seg(sid).white.inter(self.ss.traces).is_empty() {
            self.ss.fixed = self.ss.fixed.add(r, shift);
            return Ok(());
        }
        self.ss.white_seg_ref_count += 1;

        if let Some(hook) = self.ss.walk {
            // Roots walk: report the reference; the graph is not mutated.
            let before = *ref_io;
            // SAFETY: the hook outlives the walk that installed it, and
            // walks are not reentrant.
            unsafe { (*hook)(ref_io) };
            debug_assert_eq!(*ref_io, before, "roots walk must not mutate references");
            self.ss.fixed = self.ss.fixed.add(*ref_io, shift);
            return Ok(());
        }

        // Third stage: the owning pool's fix operation. Mid-trace
        // allocation failure switches every caller to the emergency
        // variant for the rest of the cycle.
        if self.inner.emergency {
            pool::seg_fix_emergency(self.inner, sid, self.ss, ref_io)?;
        } else {
            pool::seg_fix(self.inner, sid, self.ss, ref_io)?;
        }
        self.ss.fixed = self.ss.fixed.add(*ref_io, shift);
        Ok(())
    }

    /// The rank the current scan treats references at.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.ss.rank
    }

    /// Account for a formatted area about to be scanned.
    pub(crate) fn note_area(&mut self, base: Addr, limit: Addr) {
        self.ss.scanned_size += limit.saturating_sub(base);
    }
}

/// Union of the white zone sets of a set of traces.
pub(crate) fn white_union(inner: &ArenaInner, traces: TraceSet) -> ZoneSet {
    let mut white = ZoneSet::EMPTY;
    for ti in traces.iter() {
        white = white.union(inner.trace(ti).white);
    }
    white
}

fn update_counts(inner: &mut ArenaInner, traces: TraceSet, ss: &ScanState, phase: AccountingPhase) {
    for ti in traces.iter() {
        let trace = inner.trace_mut(ti);
        match phase {
            AccountingPhase::RootScan => trace.root_scan_size += ss.scanned_size,
            AccountingPhase::SegScan => trace.seg_scan_size += ss.scanned_size,
            AccountingPhase::SingleScan => {}
        }
        trace.preserved_in_place_count += ss.preserved_in_place_count;
    }
}

// ---------------------------------------------------------------------------
// Creation and destruction
// ---------------------------------------------------------------------------

/// Create a trace in state `Init`, claiming a trace index.
pub(crate) fn create(inner: &mut ArenaInner, why: CollectReason) -> Result<TraceId> {
    let Some(id) = (0..TRACE_MAX as u8)
        .map(TraceId)
        .find(|ti| !inner.busy.contains(*ti))
    else {
        return Err(GcError::Limit);
    };
    let serial = events::next_serial();
    events::trace_create(serial, why.as_str());
    inner.traces[id.0 as usize] = Some(Trace {
        id,
        serial,
        why,
        state: TraceState::Init,
        band: Rank::Ambig as u8,
        first_stretch: true,
        white: ZoneSet::EMPTY,
        condemn: CondemnSet::default(),
        condemned: 0,
        not_condemned: 0,
        foundation: 0,
        quantum_work: 0,
        root_scan_size: 0,
        seg_scan_size: 0,
        reclaim_size: 0,
        preserved_in_place_size: 0,
        preserved_in_place_count: 0,
        read_barrier_hits: 0,
        pointless_scans: 0,
        single_scans: 0,
    });
    inner.busy = inner.busy.add(id);
    Ok(id)
}

fn destroy_common(inner: &mut ArenaInner, ti: TraceId) {
    // A completed cycle ends any emergency.
    inner.emergency = false;
    inner.busy = inner.busy.del(ti);
    inner.flipped = inner.flipped.del(ti);
    let trace = inner.traces[ti.0 as usize].take().expect("trace exists");
    events::trace_destroy(trace.serial, trace.work());
}

/// Destroy a trace that never condemned anything.
pub(crate) fn destroy_init(inner: &mut ArenaInner, ti: TraceId) {
    debug_assert_eq!(inner.trace(ti).state, TraceState::Init);
    debug_assert_eq!(inner.trace(ti).condemned, 0);
    destroy_common(inner, ti);
}

/// Destroy a finished trace, freeing its index.
pub(crate) fn destroy_finished(inner: &mut ArenaInner, ti: TraceId) {
    debug_assert_eq!(inner.trace(ti).state, TraceState::Finished);
    destroy_common(inner, ti);
}

// ---------------------------------------------------------------------------
// Condemnation
// ---------------------------------------------------------------------------

/// Add a segment to the trace's white set via the pool's whiten operation.
pub(crate) fn add_white(inner: &mut ArenaInner, ti: TraceId, sid: SegId) -> Result<()> {
    debug_assert!(!inner.seg(sid).white.contains(ti));
    let before = inner.trace(ti).condemned;
    pool::seg_whiten(inner, sid, ti)?;
    if inner.seg(sid).white.contains(ti) {
        // Pools must not condemn empty segments; an empty trace must be
        // recognizable by its zero condemned size.
        debug_assert!(inner.trace(ti).condemned > before);
        let (base, limit) = {
            let seg = inner.seg(sid);
            (seg.base, seg.limit)
        };
        let zone = ZoneSet::of_range(base, limit, inner.zone_shift);
        let trace = inner.trace_mut(ti);
        trace.white = trace.white.union(zone);
    }
    Ok(())
}

/// Condemn the chosen generations and compute their predicted mortality.
///
/// Fails with `Fail` if nothing was condemned.
pub(crate) fn condemn(inner: &mut ArenaInner, ti: TraceId, set: CondemnSet) -> Result<f64> {
    debug_assert_eq!(inner.trace(ti).state, TraceState::Init);
    let mut casualty = 0.0f64;

    let pool_ids: Vec<_> = inner.pools.ids().collect();
    for &(chain, gi) in &set.gens {
        let before = inner.trace(ti).condemned;
        for &pid in &pool_ids {
            let p = inner.pools.get(pid).expect("pool just listed");
            if p.gen.chain != Some((chain, gi)) || !p.is_collectible() {
                continue;
            }
            for sid in p.segs.clone() {
                add_white(inner, ti, sid)?;
            }
        }
        let condemned_gen = inner.trace(ti).condemned - before;
        let mortality = inner.chain(chain).gens[gi].mortality;
        casualty += condemned_gen as f64 * mortality;
    }
    if set.top {
        let before = inner.trace(ti).condemned;
        for &pid in &pool_ids {
            let p = inner.pools.get(pid).expect("pool just listed");
            if p.gen.chain.is_some() || !p.is_collectible() {
                continue;
            }
            for sid in p.segs.clone() {
                add_white(inner, ti, sid)?;
            }
        }
        let condemned_gen = inner.trace(ti).condemned - before;
        casualty += condemned_gen as f64 * inner.top_gen_mortality;
    }

    let trace = inner.trace_mut(ti);
    trace.condemn = set;
    if trace.condemned == 0 {
        return Err(GcError::Fail);
    }
    let mortality = casualty / trace.condemned as f64;
    events::trace_condemn(trace.serial, trace.condemned, mortality);
    Ok(mortality)
}

// ---------------------------------------------------------------------------
// Start and flip
// ---------------------------------------------------------------------------

/// Scan one root for the trace set, entering emergency mode on allocation
/// failure.
fn scan_root(inner: &mut ArenaInner, traces: TraceSet, rank: Rank, rid: RootId) -> Result<()> {
    let mut res = scan_root_res(inner, traces, rank, rid);
    if let Err(e) = &res {
        if e.is_alloc_failure() {
            set_emergency(inner, traces);
            res = scan_root_res(inner, traces, rank, rid);
        }
    }
    res
}

fn scan_root_res(inner: &mut ArenaInner, traces: TraceSet, rank: Rank, rid: RootId) -> Result<()> {
    let white = white_union(inner, traces);
    let mut ss = ScanState::new(traces, rank, white);
    let res = crate::root::scan(inner, &mut ss, rid);
    update_counts(inner, traces, &ss, AccountingPhase::RootScan);
    res
}

/// Start a trace whose white set is established: derive the grey set, set
/// the work quantum, and flip the mutator.
pub(crate) fn start(inner: &mut ArenaInner, ti: TraceId, mortality: f64) -> Result<()> {
    debug_assert_eq!(inner.trace(ti).state, TraceState::Init);
    debug_assert!(inner.trace(ti).condemned > 0);

    // Segments that might refer into the white set become grey; everything
    // else in collectible pools is counted as not condemned.
    let white = inner.trace(ti).white;
    for sid in inner.seg_ids() {
        let (rank_set, summary, seg_white, size, pid) = {
            let s = inner.seg(sid);
            (s.rank_set, s.summary, s.white, s.size(), s.pool)
        };
        if rank_set.is_empty() {
            continue;
        }
        debug_assert!(!inner.seg(sid).grey.contains(ti));
        if summary.intersects(white) && !seg_white.contains(ti) {
            pool::seg_greyen(inner, sid, ti);
            if inner.seg(sid).grey.contains(ti) {
                inner.trace_mut(ti).foundation += size;
            }
        }
        if inner.pool(pid).is_collectible() && !seg_white.contains(ti) {
            inner.trace_mut(ti).not_condemned += size;
        }
    }

    for rid in inner.roots.ids().collect::<Vec<_>>() {
        crate::root::grey(inner, RootId(rid), ti);
    }

    // One quantum of work is the total predicted tracing work divided by
    // the polling budget, and never zero.
    {
        let avail = inner.reserved() - inner.committed();
        let trace = inner.trace_mut(ti);
        let survivors = (trace.condemned as f64 * (1.0 - mortality)) as usize;
        let finishing = (avail as f64 - survivors as f64).max(0.0);
        let polls = (finishing / FINISHING_POLLS).clamp(1.0, i64::MAX as f64);
        trace.quantum_work = (trace.foundation + survivors) / polls as usize + 1;
        trace.state = TraceState::Unflipped;
    }

    let (why, clock) = (inner.trace(ti).why, inner.poll_clock);
    inner.messages.post(Message::CollectionStart { reason: why, clock });

    flip(inner, ti)
}

/// Flip the mutator from grey to black with respect to the trace.
///
/// Buffers are tripped, unshieldable roots are scanned, and grey segments
/// gain read protection so the mutator cannot obtain white references.
fn flip(inner: &mut ArenaInner, ti: TraceId) -> Result<()> {
    debug_assert_eq!(inner.trace(ti).state, TraceState::Unflipped);
    debug_assert!(!inner.flipped.contains(ti));

    buffer::flip_all(inner);

    // Roots cannot be protected, so they are all scanned here, ambiguous
    // before exact. Weak and final roots do not exist for the same reason.
    let traces = TraceSet::single(ti);
    for rank in [Rank::Ambig, Rank::Exact] {
        for rid in inner.roots.ids().collect::<Vec<_>>() {
            if inner.roots.get(rid).expect("root just listed").rank == rank {
                scan_root(inner, traces, rank, RootId(rid))?;
            }
        }
    }

    inner.trace_mut(ti).state = TraceState::Flipped;
    inner.flipped = inner.flipped.add(ti);

    // Now that the mutator is black it must not read grey segments.
    for sid in inner.seg_ids() {
        if inner.seg(sid).grey.contains(ti) {
            seg::sync_read_barrier(inner, sid);
        }
    }

    let trace = inner.trace(ti);
    events::trace_flip(trace.serial, trace.foundation, trace.not_condemned);
    Ok(())
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

fn set_emergency(inner: &mut ArenaInner, traces: TraceSet) {
    if !inner.emergency {
        inner.emergency = true;
        if let Some(ti) = traces.first() {
            events::emergency(inner.trace(ti).serial);
        }
    }
}

/// Advance to the next band. Returns false when no bands remain.
fn band_advance(inner: &mut ArenaInner, ti: TraceId) -> bool {
    let trace = inner.trace_mut(ti);
    debug_assert_eq!(trace.state, TraceState::Flipped);
    trace.band += 1;
    trace.first_stretch = true;
    if trace.band > Rank::Weak as u8 {
        trace.band = Rank::Ambig as u8;
        return false;
    }
    events::trace_band_advance(trace.serial, trace.band);
    true
}

/// Find the next grey segment to scan, in band order.
///
/// Within band R, segments of rank R are taken first, then successively
/// earlier ranks. Ambiguous segments never appear on the grey level: the
/// tracer supports ambiguous references only in roots.
fn find_grey(inner: &mut ArenaInner, ti: TraceId) -> Option<(SegId, Rank)> {
    loop {
        let band = inner.trace(ti).band;
        let mut rank_idx = band;
        while rank_idx > Rank::Ambig as u8 {
            let rank = Rank::from_index(rank_idx);
            for sid in inner.seg_ids() {
                let s = inner.seg(sid);
                if s.grey.contains(ti) && s.rank_set.contains(rank.to_set()) {
                    // Weak scanning never discovers earlier-rank work.
                    debug_assert!(band != Rank::Weak as u8 || rank_idx == band);
                    if rank_idx != band {
                        inner.trace_mut(ti).first_stretch = false;
                    } else {
                        debug_assert!(inner.trace(ti).first_stretch);
                    }
                    return Some((sid, rank));
                }
            }
            rank_idx -= 1;
        }
        if !band_advance(inner, ti) {
            return None;
        }
    }
}

/// Fold a completed scan into the segment's summary.
///
/// With the write barrier deferred the summary must stay universal; the
/// mutator may write unobserved references at any time.
fn update_seg_summary(inner: &mut ArenaInner, ss: &ScanState, sid: SegId, was_total: bool) {
    let summary = if inner.seg(sid).defer == 0 {
        if was_total {
            ss.summary()
        } else {
            inner.seg(sid).summary.union(ss.summary())
        }
    } else {
        ZoneSet::UNIV
    };
    seg::set_summary(inner, sid, summary);
}

fn scan_seg_res(inner: &mut ArenaInner, traces: TraceSet, rank: Rank, sid: SegId) -> Result<()> {
    debug_assert!(!inner.seg(sid).grey.inter(traces).is_empty());
    let white = white_union(inner, traces);

    // A segment whose summary misses the white set has nothing to fix.
    if !inner.seg(sid).summary.intersects(white) {
        pool::seg_blacken(inner, sid, traces);
        return Ok(());
    }

    let mut ss = ScanState::new(traces, rank, white);
    {
        let trace = inner.trace(traces.first().expect("non-empty trace set"));
        let (base, size) = (inner.seg(sid).base, inner.seg(sid).size());
        events::trace_scan_seg(trace.serial, base, size, rank as u8);
    }

    shield::expose(inner, sid);
    let res = pool::seg_scan(inner, sid, &mut ss);
    shield::cover(inner, sid);

    update_counts(inner, traces, &ss, AccountingPhase::SegScan);
    if ss.white_seg_ref_count == 0 {
        for ti in traces.iter() {
            inner.trace_mut(ti).pointless_scans += 1;
        }
    }

    // Write-barrier deferral: boring scans edge towards raising the
    // barrier, interesting ones push it back.
    {
        let interesting = ss.unfixed.intersects(white);
        let defer = &mut inner.seg_mut(sid).defer;
        if interesting {
            if *defer < WB_DEFER_DELAY {
                *defer = WB_DEFER_DELAY;
            }
        } else if *defer > 0 {
            *defer -= 1;
        }
    }

    match res {
        Ok(total) => {
            update_seg_summary(inner, &ss, sid, total);
            let grey = inner.seg(sid).grey.diff(traces);
            seg::set_grey(inner, sid, grey);
            Ok(())
        }
        Err(e) => {
            // The segment stays grey; the caller may retry in emergency.
            update_seg_summary(inner, &ss, sid, false);
            Err(e)
        }
    }
}

/// Scan a segment, switching to emergency mode on allocation failure.
pub(crate) fn scan_seg(
    inner: &mut ArenaInner,
    traces: TraceSet,
    rank: Rank,
    sid: SegId,
) -> Result<()> {
    let mut res = scan_seg_res(inner, traces, rank, sid);
    if let Err(e) = &res {
        if e.is_alloc_failure() {
            set_emergency(inner, traces);
            res = scan_seg_res(inner, traces, rank, sid);
        }
    }
    res
}

/// The rank to scan at when the mutator hits a barrier on `sid`.
///
/// Scanning exact is safe except in the weak band, where the segment must
/// itself be weak and must be scanned weak so splats still happen.
pub(crate) fn rank_for_access(inner: &ArenaInner, sid: SegId) -> Rank {
    let ti = inner
        .flipped
        .first()
        .expect("barrier hit without a flipped trace");
    let band = inner.trace(ti).band;
    let rank_set = inner.seg(sid).rank_set;
    match Rank::from_index(band.min(Rank::Weak as u8)) {
        Rank::Ambig | Rank::Exact => Rank::Exact,
        Rank::Final => {
            if rank_set == RankSet::FINAL {
                Rank::Final
            } else {
                Rank::Exact
            }
        }
        Rank::Weak => {
            debug_assert_eq!(rank_set, RankSet::WEAK);
            Rank::Weak
        }
    }
}

/// Handle a barrier hit on a segment: the shared (class-default) part.
pub(crate) fn seg_access(inner: &mut ArenaInner, sid: SegId, mode: AccessSet) -> Result<()> {
    let denied = inner.seg(sid).shield.desired;
    let hit = mode & denied;
    let read_hit = hit.contains(AccessSet::READ);
    let write_hit = hit.contains(AccessSet::WRITE);
    {
        let seg = inner.seg(sid);
        events::barrier_hit(seg.base, seg.base, read_hit, write_hit);
    }

    if write_hit {
        inner.seg_mut(sid).defer = WB_DEFER_HIT;
    }

    if read_hit {
        // A read hit means the segment is grey for a flipped trace; scan it
        // so the mutator can no longer obtain white references from it.
        debug_assert!(!inner.seg(sid).grey.inter(inner.flipped).is_empty());
        let traces = inner.flipped;
        let rank = rank_for_access(inner, sid);
        scan_seg(inner, traces, rank, sid)?;
        debug_assert!(inner.seg(sid).grey.inter(traces).is_empty());
        for ti in traces.iter() {
            inner.trace_mut(ti).read_barrier_hits += 1;
        }
    }

    // After the read handling: the scan may have set a summary and raised
    // the write barrier, which the write hit must now clear.
    if write_hit {
        seg::set_summary(inner, sid, ZoneSet::UNIV);
    }
    Ok(())
}

fn scan_single_ref_res(
    inner: &mut ArenaInner,
    traces: TraceSet,
    rank: Rank,
    sid: SegId,
    addr: Addr,
) -> Result<()> {
    let white = white_union(inner, traces);
    if !inner.seg(sid).summary.intersects(white) {
        return Ok(());
    }
    let mut ss = ScanState::new(traces, rank, white);
    shield::expose(inner, sid);
    // SAFETY: the segment is exposed and addr is a word-aligned location
    // inside it (checked by the caller).
    let mut r = unsafe { arith::load_ref(addr) };
    let res = {
        let mut ctx = ScanCtx {
            inner: &mut *inner,
            ss: &mut ss,
        };
        ctx.fix(&mut r)
    };
    if res.is_ok() {
        unsafe { arith::store_ref(addr, r) };
    }
    ss.scanned_size = WORD_WIDTH / 8;
    let summary = inner.seg(sid).summary.add(r, inner.zone_shift);
    seg::set_summary(inner, sid, summary);
    shield::cover(inner, sid);
    update_counts(inner, traces, &ss, AccountingPhase::SingleScan);
    res
}

/// Scan exactly one reference slot. Never fails: emergency mode absorbs
/// allocation failure.
pub(crate) fn scan_single_ref(
    inner: &mut ArenaInner,
    traces: TraceSet,
    rank: Rank,
    sid: SegId,
    addr: Addr,
) {
    let res = scan_single_ref_res(inner, traces, rank, sid, addr);
    if let Err(e) = res {
        debug_assert!(e.is_alloc_failure());
        set_emergency(inner, traces);
        scan_single_ref_res(inner, traces, rank, sid, addr)
            .expect("emergency single-reference scan cannot fail");
    }
}

// ---------------------------------------------------------------------------
// Reclaim and advance
// ---------------------------------------------------------------------------

fn reclaim(inner: &mut ArenaInner, ti: TraceId) {
    debug_assert_eq!(inner.trace(ti).state, TraceState::Reclaim);
    for sid in inner.seg_ids() {
        if !inner.segs.contains(sid.0) {
            continue;
        }
        let seg = inner.seg(sid);
        debug_assert!(!seg.grey.contains(ti), "grey segment at reclaim");
        if seg.white.contains(ti) {
            pool::seg_reclaim(inner, sid, ti);
            // The segment may have been freed; if it survives it must no
            // longer be white for this trace.
            debug_assert!(
                !inner.segs.contains(sid.0) || !inner.seg(sid).white.contains(ti)
            );
        }
    }

    let clock = inner.poll_clock;
    let trace = inner.trace_mut(ti);
    trace.state = TraceState::Finished;
    trace.preserved_in_place_size = trace.condemned - trace.reclaim_size;
    events::trace_reclaim(trace.serial, trace.reclaim_size, trace.preserved_in_place_size);
    let message = Message::Collection {
        live: trace.preserved_in_place_size,
        condemned: trace.condemned,
        not_condemned: trace.not_condemned,
        clock,
    };
    inner.messages.post(message);
}

/// Progress a trace by one step.
pub(crate) fn advance(inner: &mut ArenaInner, ti: TraceId) {
    match inner.trace(ti).state {
        TraceState::Flipped => {
            if let Some((sid, rank)) = find_grey(inner, ti) {
                let res = scan_seg(inner, TraceSet::single(ti), rank, sid);
                debug_assert!(res.is_ok(), "scan failed outside emergency handling");
            } else {
                inner.trace_mut(ti).state = TraceState::Reclaim;
            }
        }
        TraceState::Reclaim => reclaim(inner, ti),
        // Traces flip at start; Unflipped is not steppable, and advancing
        // Init or Finished traces is a caller bug.
        TraceState::Init | TraceState::Unflipped | TraceState::Finished => {
            unreachable!("trace advanced in state {:?}", inner.trace(ti).state)
        }
    }
}

/// Advance a trace by one quantum of work, destroying it when finished.
pub(crate) fn advance_quantum(inner: &mut ArenaInner, ti: TraceId) {
    let end_work = inner.trace(ti).work() + inner.trace(ti).quantum_work;
    loop {
        advance(inner, ti);
        let trace = inner.trace(ti);
        if trace.state == TraceState::Finished {
            destroy_finished(inner, ti);
            return;
        }
        if trace.work() >= end_work {
            return;
        }
    }
}

/// Run a trace to completion and destroy it.
pub(crate) fn run_to_completion(inner: &mut ArenaInner, ti: TraceId) {
    while inner.traces[ti.0 as usize].is_some() {
        advance_quantum(inner, ti);
    }
}

/// Create, condemn, and start a collection. On an empty condemn set the
/// trace is destroyed quietly and `Fail` is returned.
pub(crate) fn start_collection(
    inner: &mut ArenaInner,
    why: CollectReason,
    set: CondemnSet,
) -> Result<TraceId> {
    let ti = create(inner, why)?;
    let mortality = match condemn(inner, ti, set) {
        Ok(m) => m,
        Err(e) => {
            destroy_init(inner, ti);
            return Err(e);
        }
    };
    start(inner, ti, mortality)?;
    Ok(ti)
}

/// The condemn set naming every generation of every chain plus the top
/// generation.
pub(crate) fn condemn_all(inner: &ArenaInner) -> CondemnSet {
    let mut gens = Vec::new();
    for (cid, chain) in inner.chains.iter() {
        for gi in 0..chain.gens.len() {
            gens.push((ChainId(cid), gi));
        }
    }
    CondemnSet { gens, top: true }
}
