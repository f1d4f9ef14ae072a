//! The arena: one reserved address range holding all pools and traces.
//!
//! Every public operation enters the arena (an exclusive lock), does its
//! work against [`ArenaInner`], and flushes the shield's queued protections
//! on the way out. Collection runs on mutator time slices: allocation slow
//! paths and [`Arena::step`] poll the trace engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arith::{self, Addr, Word, WORD_WIDTH};
use crate::bt::BitTable;
use crate::buffer::{Ap, ApId};
use crate::error::{GcError, Result};
use crate::events;
use crate::message::{Message, MessageKind, MessageQueue};
use crate::pool::{
    self, AmsOptions, AwlOptions, Chain, ChainId, GenDesc, GenParams, Pool, PoolClassId, PoolId,
    SncOptions,
};
use crate::root::{Root, RootId, RootKind, RootScanFn};
use crate::seg::{AccessSet, Rank, Seg, SegId, SegPayload};
use crate::shield::ShieldQueue;
use crate::slab::Slab;
use crate::thread::{ThreadEntry, ThreadId};
use crate::trace::{self, Trace, TraceId, TraceSet, TRACE_MAX};
use crate::walk::{self, AreaWalkFn};

/// Why a collection started; carried on the start message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectReason {
    /// The client requested a collection.
    ClientRequest,
    /// A generation exceeded its capacity threshold.
    ChainThreshold,
    /// A synthetic trace backing a walker.
    Walk,
}

impl CollectReason {
    /// Human-readable reason string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequest => "client request",
            Self::ChainThreshold => "chain threshold",
            Self::Walk => "root walk",
        }
    }
}

/// Configuration for creating an arena.
#[derive(Debug, Clone, Copy)]
pub struct ArenaOptions {
    pub(crate) size: usize,
    pub(crate) grain_size: usize,
    pub(crate) hint_addr: usize,
    pub(crate) barriers: bool,
    pub(crate) commit_limit: Option<usize>,
}

impl ArenaOptions {
    /// Options for an arena reserving `size` bytes of address space.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            grain_size: 4096,
            hint_addr: 0,
            barriers: true,
            commit_limit: None,
        }
    }

    /// Arena grain size: the unit of segment placement. Power of two.
    #[must_use]
    pub fn grain_size(mut self, grain_size: usize) -> Self {
        self.grain_size = grain_size;
        self
    }

    /// Placement hint for the reservation.
    #[must_use]
    pub fn hint_addr(mut self, hint: usize) -> Self {
        self.hint_addr = hint;
        self
    }

    /// Whether barrier state is realized as page protection. When off, the
    /// shield tracks modes without issuing protection syscalls; barrier
    /// hits are still honored when delivered through [`Arena::access`].
    #[must_use]
    pub fn barriers(mut self, barriers: bool) -> Self {
        self.barriers = barriers;
        self
    }

    /// Cap on committed bytes.
    #[must_use]
    pub fn commit_limit(mut self, limit: usize) -> Self {
        self.commit_limit = Some(limit);
        self
    }
}

/// All arena state, behind the arena lock.
pub(crate) struct ArenaInner {
    reservation: sys_vm::Reservation,
    pub(crate) base: Addr,
    pub(crate) grain_size: usize,
    pub(crate) grain_shift: u32,
    pub(crate) grains: usize,
    pub(crate) zone_shift: u32,
    pub(crate) barriers: bool,
    commit_limit: Option<usize>,
    /// One bit per grain: set while owned by a segment.
    grain_map: BitTable,
    pub(crate) committed_grains: usize,
    /// Address-ordered segment index.
    seg_map: BTreeMap<Addr, SegId>,
    pub(crate) segs: Slab<Seg>,
    pub(crate) pools: Slab<Pool>,
    pub(crate) chains: Slab<Chain>,
    pub(crate) top_gen_mortality: f64,
    pub(crate) roots: Slab<Root>,
    pub(crate) threads: Slab<ThreadEntry>,
    pub(crate) aps: Slab<Ap>,
    pub(crate) traces: [Option<Trace>; TRACE_MAX],
    pub(crate) busy: TraceSet,
    pub(crate) flipped: TraceSet,
    pub(crate) emergency: bool,
    pub(crate) parked: bool,
    pub(crate) poll_clock: u64,
    pub(crate) messages: MessageQueue,
    pub(crate) shield: ShieldQueue,
}

impl ArenaInner {
    pub(crate) fn seg(&self, sid: SegId) -> &Seg {
        self.segs.get(sid.0).expect("stale segment id")
    }

    pub(crate) fn seg_mut(&mut self, sid: SegId) -> &mut Seg {
        self.segs.get_mut(sid.0).expect("stale segment id")
    }

    pub(crate) fn pool(&self, pid: PoolId) -> &Pool {
        self.pools.get(pid.0).expect("stale pool id")
    }

    pub(crate) fn pool_mut(&mut self, pid: PoolId) -> &mut Pool {
        self.pools.get_mut(pid.0).expect("stale pool id")
    }

    pub(crate) fn ap(&self, id: ApId) -> &Ap {
        self.aps.get(id.0).expect("stale allocation point id")
    }

    pub(crate) fn ap_mut(&mut self, id: ApId) -> &mut Ap {
        self.aps.get_mut(id.0).expect("stale allocation point id")
    }

    pub(crate) fn trace(&self, ti: TraceId) -> &Trace {
        self.traces[ti.0 as usize].as_ref().expect("stale trace id")
    }

    pub(crate) fn trace_mut(&mut self, ti: TraceId) -> &mut Trace {
        self.traces[ti.0 as usize].as_mut().expect("stale trace id")
    }

    pub(crate) fn chain(&self, cid: ChainId) -> &Chain {
        self.chains.get(cid.0).expect("stale chain id")
    }

    /// Address space reserved, in bytes.
    pub(crate) fn reserved(&self) -> usize {
        self.grains << self.grain_shift
    }

    /// Storage committed to segments, in bytes.
    pub(crate) fn committed(&self) -> usize {
        self.committed_grains << self.grain_shift
    }

    /// Locate the segment containing `addr`.
    pub(crate) fn seg_of_addr(&self, addr: Addr) -> Option<SegId> {
        if !self.reservation.contains(addr) {
            return None;
        }
        let (_, &sid) = self.seg_map.range(..=addr).next_back()?;
        self.segs
            .get(sid.0)
            .and_then(|seg| seg.contains(addr).then_some(sid))
    }

    /// All segments in address order.
    pub(crate) fn seg_ids(&self) -> Vec<SegId> {
        self.seg_map.values().copied().collect()
    }

    /// Place a fresh segment of `bytes` (a grain multiple) for a pool.
    pub(crate) fn place_seg(
        &mut self,
        pid: PoolId,
        bytes: usize,
        payload: SegPayload,
    ) -> Result<SegId> {
        debug_assert!(arith::is_aligned(bytes, self.grain_size));
        let grains = bytes >> self.grain_shift;
        if let Some(limit) = self.commit_limit {
            if self.committed() + bytes > limit {
                return Err(GcError::Limit);
            }
        }
        let (lo, _) = self
            .grain_map
            .find_reset_run(0, self.grains, grains)
            .ok_or(GcError::Memory)?;
        let base = self.base + (lo << self.grain_shift);
        // SAFETY: [base, base + bytes) lies inside our reservation and is
        // not owned by any segment.
        unsafe { sys_vm::commit(base as *mut u8, bytes) }.map_err(GcError::Resource)?;
        self.grain_map.set_range(lo, lo + grains);
        self.committed_grains += grains;

        let sid = SegId(self.segs.insert(Seg::new(base, base + bytes, pid, payload)));
        self.seg_map.insert(base, sid);
        self.pool_mut(pid).segs.push(sid);
        self.pool_mut(pid).gen.account_seg_create(bytes);
        events::seg_alloc(base, bytes, pid.0);
        Ok(sid)
    }

    /// Return a segment's storage to the arena.
    pub(crate) fn free_seg(&mut self, sid: SegId) {
        let seg = self.segs.remove(sid.0).expect("stale segment id");
        debug_assert!(seg.buffer.is_none());
        let (base, bytes, pid) = (seg.base, seg.limit - seg.base, seg.pool);
        self.seg_map.remove(&base);
        self.pool_mut(pid).segs.retain(|s| *s != sid);
        self.pool_mut(pid).gen.account_seg_free(bytes);

        let lo = (base - self.base) >> self.grain_shift;
        let grains = bytes >> self.grain_shift;
        self.grain_map.reset_range(lo, lo + grains);
        self.committed_grains -= grains;
        // SAFETY: the span was committed at placement and no live segment
        // covers it any more.
        let _ = unsafe { sys_vm::decommit(base as *mut u8, bytes) };
        events::seg_free(base, bytes, pid.0);
    }

    /// Detach a segment from the bookkeeping for a merge; its storage is
    /// absorbed by the lower neighbour.
    pub(crate) fn take_seg_for_merge(&mut self, sid: SegId) -> Seg {
        let seg = self.segs.remove(sid.0).expect("stale segment id");
        self.seg_map.remove(&seg.base);
        let pid = seg.pool;
        self.pool_mut(pid).segs.retain(|s| *s != sid);
        seg
    }

    /// Register the upper half produced by a split; storage is already
    /// committed and accounted.
    pub(crate) fn adopt_split_seg(
        &mut self,
        pid: PoolId,
        base: Addr,
        limit: Addr,
        payload: SegPayload,
    ) -> SegId {
        let sid = SegId(self.segs.insert(Seg::new(base, limit, pid, payload)));
        self.seg_map.insert(base, sid);
        self.pool_mut(pid).segs.push(sid);
        sid
    }
}

/// Run all busy traces to completion.
fn finish_all(inner: &mut ArenaInner) {
    while let Some(ti) = inner.busy.first() {
        trace::run_to_completion(inner, ti);
    }
}

/// Pick a generation whose accumulated new allocation exceeds its
/// capacity. Generations under an active ramp pattern are deferred.
fn policy_find_gen(inner: &ArenaInner) -> Option<(ChainId, usize)> {
    for (cid, chain) in inner.chains.iter() {
        let mut target = None;
        for gi in 0..chain.gens.len() {
            let mut new_size = 0;
            let mut ramped = false;
            for (_, p) in inner.pools.iter() {
                if p.gen.chain == Some((ChainId(cid), gi)) {
                    new_size += p.gen.new_size;
                    ramped |= p.gen.ramp_depth > 0;
                }
            }
            if ramped {
                continue;
            }
            if new_size > chain.gens[gi].capacity {
                target = Some(gi);
            }
        }
        if let Some(gi) = target {
            return Some((ChainId(cid), gi));
        }
    }
    None
}

/// One mutator-time poll: advance the running trace by a quantum, or
/// consider starting one.
pub(crate) fn poll(inner: &mut ArenaInner) {
    if inner.parked {
        return;
    }
    inner.poll_clock += 1;
    if let Some(ti) = inner.busy.first() {
        trace::advance_quantum(inner, ti);
    } else if let Some((chain, gi)) = policy_find_gen(inner) {
        // Condemn the chosen generation and everything younger,
        // leaves first.
        let gens = (0..=gi).map(|i| (chain, i)).collect();
        let set = trace::CondemnSet { gens, top: false };
        let _ = trace::start_collection(inner, CollectReason::ChainThreshold, set);
    }
}

/// An incremental, generational, pool-structured garbage-collected arena.
///
/// The arena owns a contiguous reservation of address space, carved into
/// grain-aligned segments owned by pools. Collection is cooperative: it
/// runs during allocation polls, [`step`], and [`collect`].
///
/// [`step`]: Self::step
/// [`collect`]: Self::collect
pub struct Arena {
    inner: Mutex<ArenaInner>,
}

impl Arena {
    /// Create an arena.
    ///
    /// # Errors
    ///
    /// `Param` for a zero size or non-power-of-two grain; `Resource` if the
    /// OS cannot reserve the address space.
    pub fn new(options: ArenaOptions) -> Result<Arc<Self>> {
        if options.size == 0
            || !options.grain_size.is_power_of_two()
            || options.size < options.grain_size
        {
            return Err(GcError::Param);
        }
        let size = arith::align_up(options.size, sys_vm::allocation_granularity());
        let reservation =
            sys_vm::Reservation::new(size, options.hint_addr).map_err(GcError::Resource)?;
        let base = reservation.base() as Addr;
        let grain_size = options.grain_size;
        let grain_shift = grain_size.trailing_zeros();
        let grains = size >> grain_shift;

        // Zones stripe the reservation into one word's worth of equal
        // parts, but never finer than a grain.
        let zone_shift = (size.next_power_of_two().trailing_zeros())
            .saturating_sub(WORD_WIDTH.trailing_zeros())
            .max(grain_shift);

        // Real page protection needs protection spans no finer than a
        // page; otherwise the shield only tracks modes.
        let barriers = options.barriers && grain_size % sys_vm::page_size() == 0;

        Ok(Arc::new(Self {
            inner: Mutex::new(ArenaInner {
                reservation,
                base,
                grain_size,
                grain_shift,
                grains,
                zone_shift,
                barriers,
                commit_limit: options.commit_limit,
                grain_map: BitTable::new(grains),
                committed_grains: 0,
                seg_map: BTreeMap::new(),
                segs: Slab::new(),
                pools: Slab::new(),
                chains: Slab::new(),
                top_gen_mortality: 0.51,
                roots: Slab::new(),
                threads: Slab::new(),
                aps: Slab::new(),
                traces: [None, None, None, None],
                busy: TraceSet::EMPTY,
                flipped: TraceSet::EMPTY,
                emergency: false,
                parked: false,
                poll_clock: 0,
                messages: MessageQueue::new(),
                shield: ShieldQueue::new(),
            }),
        }))
    }

    /// Enter the arena: exclusive access, with the shield flushed on exit.
    pub(crate) fn enter<R>(&self, f: impl FnOnce(&mut ArenaInner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        crate::shield::flush(&mut inner);
        result
    }

    // -- Collection control -------------------------------------------------

    /// Park the arena: finish all collection and start no more until
    /// [`release`].
    ///
    /// [`release`]: Self::release
    pub fn park(&self) {
        self.enter(|inner| {
            finish_all(inner);
            inner.parked = true;
        });
    }

    /// Allow collection again after [`park`].
    ///
    /// [`park`]: Self::park
    pub fn release(&self) {
        self.enter(|inner| inner.parked = false);
    }

    /// Collect the whole arena now, running the cycle to completion.
    ///
    /// # Errors
    ///
    /// `Limit` if no trace slot is free; allocation errors from scanning
    /// are absorbed by emergency mode.
    pub fn collect(&self) -> Result<()> {
        self.enter(|inner| {
            inner.poll_clock += 1;
            finish_all(inner);
            match trace::start_collection(
                inner,
                CollectReason::ClientRequest,
                trace::condemn_all(inner),
            ) {
                Ok(ti) => {
                    trace::run_to_completion(inner, ti);
                    Ok(())
                }
                // Nothing condemnable is a successful no-op.
                Err(GcError::Fail) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    /// Start a whole-arena collection but return as soon as it is flipped;
    /// the cycle proceeds on polls and [`step`] calls.
    ///
    /// # Errors
    ///
    /// As for [`collect`].
    ///
    /// [`collect`]: Self::collect
    /// [`step`]: Self::step
    pub fn start_collect(&self) -> Result<()> {
        self.enter(|inner| {
            inner.poll_clock += 1;
            finish_all(inner);
            match trace::start_collection(
                inner,
                CollectReason::ClientRequest,
                trace::condemn_all(inner),
            ) {
                Ok(_) | Err(GcError::Fail) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    /// Do up to `work` bytes of collection work. Returns whether any work
    /// was done (or a collection was started).
    pub fn step(&self, work: usize) -> bool {
        self.enter(|inner| {
            if inner.parked {
                return false;
            }
            inner.poll_clock += 1;
            if let Some(ti) = inner.busy.first() {
                let end = inner.trace(ti).work() + work.max(1);
                loop {
                    trace::advance(inner, ti);
                    if inner.trace(ti).state == trace::TraceState::Finished {
                        trace::destroy_finished(inner, ti);
                        break;
                    }
                    if inner.trace(ti).work() >= end {
                        break;
                    }
                }
                true
            } else if let Some((chain, gi)) = policy_find_gen(inner) {
                let gens = (0..=gi).map(|i| (chain, i)).collect();
                let set = trace::CondemnSet { gens, top: false };
                trace::start_collection(inner, CollectReason::ChainThreshold, set).is_ok()
            } else {
                false
            }
        })
    }

    /// Report a barrier hit at `addr` to the collector.
    ///
    /// This is the delivery contract for the embedder's fault handler: the
    /// collector scans as needed so the faulting access can proceed.
    ///
    /// # Errors
    ///
    /// `Fail` if `addr` is not managed by this arena.
    pub fn access(&self, addr: Addr, mode: AccessSet) -> Result<()> {
        self.enter(|inner| {
            let sid = inner.seg_of_addr(addr).ok_or(GcError::Fail)?;
            pool::seg_access(inner, sid, addr, mode)
        })
    }

    // -- Introspection ------------------------------------------------------

    /// Bytes of address space reserved.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.enter(|inner| inner.reserved())
    }

    /// Bytes committed to segments.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.enter(|inner| inner.committed())
    }

    /// Whether `addr` lies in storage managed by this arena. In particular
    /// `has_addr(0)` is false.
    #[must_use]
    pub fn has_addr(&self, addr: Addr) -> bool {
        self.enter(|inner| inner.seg_of_addr(addr).is_some())
    }

    /// One diagnostic line per segment, in address order: extent, owning
    /// pool, rank set, and per-trace white/grey membership.
    #[must_use]
    pub fn describe_segs(&self) -> Vec<String> {
        self.enter(|inner| {
            inner
                .seg_ids()
                .into_iter()
                .map(|sid| {
                    let s = inner.seg(sid);
                    format!(
                        "{:#x}..{:#x} pool {} rank {:?} white {:#06b} grey {:#06b}",
                        s.base, s.limit, s.pool.0, s.rank_set, s.white.0, s.grey.0
                    )
                })
                .collect()
        })
    }

    // -- Chains and pools ---------------------------------------------------

    /// Create a generation chain.
    ///
    /// # Errors
    ///
    /// `Param` for an empty chain or a mortality outside [0, 1].
    pub fn chain_create(&self, gens: &[GenParams]) -> Result<ChainId> {
        if gens.is_empty() || gens.iter().any(|g| !(0.0..=1.0).contains(&g.mortality)) {
            return Err(GcError::Param);
        }
        self.enter(|inner| {
            let chain = Chain {
                gens: gens
                    .iter()
                    .map(|g| GenDesc {
                        capacity: g.capacity,
                        mortality: g.mortality,
                    })
                    .collect(),
            };
            Ok(ChainId(inner.chains.insert(chain)))
        })
    }

    fn pool_create(&self, pool: Pool) -> Result<PoolId> {
        if !pool.align.is_power_of_two() {
            return Err(GcError::Param);
        }
        self.enter(|inner| {
            if pool.align > inner.grain_size {
                return Err(GcError::Param);
            }
            if let Some((chain, gi)) = pool.gen.chain {
                if !inner.chains.contains(chain.0)
                    || gi >= inner.chain(chain).gens.len()
                {
                    return Err(GcError::Param);
                }
            }
            Ok(PoolId(inner.pools.insert(pool)))
        })
    }

    /// Create an automatic mark-and-sweep pool.
    ///
    /// # Errors
    ///
    /// `Param` for a bad alignment or chain reference.
    pub fn pool_create_ams(&self, options: AmsOptions) -> Result<PoolId> {
        self.pool_create(pool::ams::make_pool(&options))
    }

    /// Create an automatic weak-linked pool.
    ///
    /// # Errors
    ///
    /// `Param` for a bad alignment or chain reference.
    pub fn pool_create_awl(&self, options: AwlOptions) -> Result<PoolId> {
        self.pool_create(pool::awl::make_pool(&options))
    }

    /// Create a stack-no-check pool.
    ///
    /// # Errors
    ///
    /// `Param` for a bad alignment.
    pub fn pool_create_snc(&self, options: SncOptions) -> Result<PoolId> {
        self.pool_create(pool::snc::make_pool(&options))
    }

    /// Destroy a pool, returning all its storage.
    ///
    /// # Errors
    ///
    /// `Param` for a stale id; `Fail` while a collection is busy or an
    /// allocation point is still attached to the pool.
    pub fn pool_destroy(&self, pid: PoolId) -> Result<()> {
        self.enter(|inner| {
            if !inner.pools.contains(pid.0) {
                return Err(GcError::Param);
            }
            if !inner.busy.is_empty() {
                return Err(GcError::Fail);
            }
            if inner.pool(pid).segs.iter().any(|&s| inner.seg(s).buffer.is_some()) {
                return Err(GcError::Fail);
            }
            // The pool's storage all becomes free as the pool dies.
            {
                let gen = &mut inner.pool_mut(pid).gen;
                gen.free_size = gen.total_size;
                gen.buffered_size = 0;
                gen.new_size = 0;
                gen.old_size = 0;
            }
            for sid in inner.pool(pid).segs.clone() {
                inner.free_seg(sid);
            }
            inner.pools.remove(pid.0);
            Ok(())
        })
    }

    /// Total storage owned by a pool.
    #[must_use]
    pub fn pool_total_size(&self, pid: PoolId) -> usize {
        self.enter(|inner| inner.pool(pid).total_size())
    }

    /// Storage owned by a pool but not handed to the client.
    #[must_use]
    pub fn pool_free_size(&self, pid: PoolId) -> usize {
        self.enter(|inner| inner.pool(pid).free_size())
    }

    /// One diagnostic line describing a pool.
    #[must_use]
    pub fn pool_describe(&self, pid: PoolId) -> String {
        self.enter(|inner| pool::describe(inner, pid))
    }

    // -- Roots and threads --------------------------------------------------

    /// Register a table of `count` exact or ambiguous references.
    ///
    /// # Errors
    ///
    /// `Param` for a weak or final rank.
    ///
    /// # Safety
    ///
    /// `[base, base + count * word)` must stay valid and word-aligned for
    /// the life of the root.
    pub unsafe fn root_create_table(
        &self,
        rank: Rank,
        base: Addr,
        count: usize,
    ) -> Result<RootId> {
        self.enter(|inner| {
            let root = Root::new(rank, RootKind::Table {
                base,
                count,
                mask: None,
            })?;
            Ok(RootId(inner.roots.insert(root)))
        })
    }

    /// Register a table whose words are references only when
    /// `word & mask == 0`.
    ///
    /// # Errors
    ///
    /// `Param` for a weak or final rank.
    ///
    /// # Safety
    ///
    /// As for [`root_create_table`].
    ///
    /// [`root_create_table`]: Self::root_create_table
    pub unsafe fn root_create_table_masked(
        &self,
        rank: Rank,
        base: Addr,
        count: usize,
        mask: Word,
    ) -> Result<RootId> {
        self.enter(|inner| {
            let root = Root::new(rank, RootKind::Table {
                base,
                count,
                mask: Some(mask),
            })?;
            Ok(RootId(inner.roots.insert(root)))
        })
    }

    /// Register a thread's registers and stack as an ambiguous root.
    ///
    /// # Errors
    ///
    /// `Param` for a stale thread id.
    pub fn root_create_thread(&self, thread: ThreadId) -> Result<RootId> {
        self.enter(|inner| {
            if !inner.threads.contains(thread.0) {
                return Err(GcError::Param);
            }
            let root = Root::new(Rank::Ambig, RootKind::Thread(thread))?;
            Ok(RootId(inner.roots.insert(root)))
        })
    }

    /// Register a client-scanned root.
    ///
    /// # Errors
    ///
    /// `Param` for a weak or final rank.
    pub fn root_create_scan(
        &self,
        rank: Rank,
        scan: RootScanFn,
        closure: usize,
    ) -> Result<RootId> {
        self.enter(|inner| {
            let root = Root::new(rank, RootKind::Callback { scan, closure })?;
            Ok(RootId(inner.roots.insert(root)))
        })
    }

    /// Destroy a root.
    ///
    /// # Errors
    ///
    /// `Param` for a stale id.
    pub fn root_destroy(&self, rid: RootId) -> Result<()> {
        self.enter(|inner| {
            inner
                .roots
                .remove(rid.0)
                .map(|_| ())
                .ok_or(GcError::Param)
        })
    }

    /// Register the calling mutator thread.
    ///
    /// # Safety
    ///
    /// `cold_end` must be the cold (old) end of the calling thread's stack;
    /// the span from the current stack pointer to it must stay readable
    /// whenever the thread is inside the arena.
    pub unsafe fn thread_register(&self, cold_end: Addr) -> ThreadId {
        self.enter(|inner| ThreadId(inner.threads.insert(ThreadEntry { cold_end })))
    }

    /// Deregister a thread.
    ///
    /// # Errors
    ///
    /// `Param` for a stale id.
    pub fn thread_deregister(&self, tid: ThreadId) -> Result<()> {
        self.enter(|inner| {
            // Thread roots over this thread become invalid with it.
            let dangling: Vec<u32> = inner
                .roots
                .iter()
                .filter_map(|(rid, r)| {
                    matches!(r.kind, RootKind::Thread(t) if t == tid).then_some(rid)
                })
                .collect();
            for rid in dangling {
                inner.roots.remove(rid);
            }
            inner
                .threads
                .remove(tid.0)
                .map(|_| ())
                .ok_or(GcError::Param)
        })
    }

    // -- Messages -----------------------------------------------------------

    /// The kind of the next pending message, if any.
    #[must_use]
    pub fn message_peek(&self) -> Option<MessageKind> {
        self.enter(|inner| inner.messages.peek_kind())
    }

    /// Take the next pending message.
    #[must_use]
    pub fn message_poll(&self) -> Option<Message> {
        self.enter(|inner| inner.messages.next())
    }

    /// Drop the next pending message without reading it.
    pub fn message_discard(&self) {
        self.enter(|inner| inner.messages.discard());
    }

    // -- Walkers ------------------------------------------------------------

    /// Visit every formatted object. The arena must be parked.
    ///
    /// # Errors
    ///
    /// `Fail` if the arena is not parked.
    pub fn formatted_objects_walk(
        &self,
        mut visitor: impl FnMut(Addr, PoolId),
    ) -> Result<()> {
        self.enter(|inner| walk::formatted_objects_walk(inner, &mut visitor))
    }

    /// Walk one pool's formatted areas through an area-scan callback. The
    /// arena must be parked.
    ///
    /// # Errors
    ///
    /// `Fail` if the arena is not parked; `Param` for a stale pool.
    pub fn pool_walk(&self, pid: PoolId, area: AreaWalkFn, closure: usize) -> Result<()> {
        self.enter(|inner| walk::pool_walk(inner, pid, area, closure))
    }

    /// Visit every reference in every root without mutating anything. The
    /// arena must be parked.
    ///
    /// # Errors
    ///
    /// `Fail` if the arena is not parked; `Limit` if no trace slot is free.
    pub fn roots_walk(&self, mut visitor: impl FnMut(Addr, RootId)) -> Result<()> {
        self.enter(|inner| walk::roots_walk(inner, &mut visitor))
    }

    // -- Segment restructuring ----------------------------------------------

    /// Split the segment containing `at` at that address.
    ///
    /// # Errors
    ///
    /// `Param` for an unmanaged or misaligned address; `Unimpl` if the
    /// owning pool class does not split; `Fail` if the segment is busy.
    pub fn seg_split(&self, at: Addr) -> Result<()> {
        self.enter(|inner| {
            let sid = inner.seg_of_addr(at).ok_or(GcError::Param)?;
            match inner.pool(inner.seg(sid).pool).class_id() {
                PoolClassId::Ams => pool::ams::seg_split(inner, sid, at).map(|_| ()),
                _ => Err(GcError::Unimpl),
            }
        })
    }

    /// Merge the two segments meeting at `at`.
    ///
    /// # Errors
    ///
    /// `Param` unless `at` is a boundary between two segments of one pool;
    /// `Unimpl` if the class does not merge; `Fail` if either is busy.
    pub fn seg_merge(&self, at: Addr) -> Result<()> {
        self.enter(|inner| {
            let hi = inner.seg_of_addr(at).ok_or(GcError::Param)?;
            if inner.seg(hi).base != at || at == inner.base {
                return Err(GcError::Param);
            }
            let lo = inner.seg_of_addr(at - 1).ok_or(GcError::Param)?;
            match inner.pool(inner.seg(lo).pool).class_id() {
                PoolClassId::Ams => pool::ams::seg_merge(inner, lo, hi),
                _ => Err(GcError::Unimpl),
            }
        })
    }
}

// The raw addresses inside are either owned by the reservation or
// registered by clients under documented validity contracts; all access is
// serialized by the arena lock.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.enter(|inner| {
            f.debug_struct("Arena")
                .field("reserved", &inner.reserved())
                .field("committed", &inner.committed())
                .field("grain_size", &inner.grain_size)
                .field("pools", &inner.pools.len())
                .field("parked", &inner.parked)
                .finish()
        })
    }
}
