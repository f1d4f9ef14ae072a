//! Roots.
//!
//! A root describes a set of locations the mutator treats as live starting
//! points: a table of words, a registered thread's stack and registers, or
//! a client scanning callback. Each root has a rank; thread roots are
//! always ambiguous.

use crate::arena::ArenaInner;
use crate::arith::{self, Addr, Word, WORD_WIDTH};
use crate::error::{GcError, Result};
use crate::seg::Rank;
use crate::thread::{self, ThreadId};
use crate::trace::{ScanCtx, ScanState, TraceId, TraceSet};

/// Handle for a registered root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootId(pub(crate) u32);

/// Client scanning callback for callback roots: fix every reference the
/// root holds, passing `closure` through unchanged.
pub type RootScanFn = fn(&mut ScanCtx<'_>, usize) -> Result<()>;

#[derive(Clone, Copy)]
pub(crate) enum RootKind {
    /// A table of `count` words at `base`. With a mask, words where
    /// `word & mask != 0` are not references and are skipped.
    Table {
        base: Addr,
        count: usize,
        mask: Option<Word>,
    },
    /// A registered thread's registers and control stack, scanned
    /// conservatively.
    Thread(ThreadId),
    /// A client callback that scans an arbitrary location set.
    Callback { scan: RootScanFn, closure: usize },
}

pub(crate) struct Root {
    pub(crate) rank: Rank,
    pub(crate) kind: RootKind,
    /// Traces for which this root has not yet been scanned.
    pub(crate) grey: TraceSet,
}

impl Root {
    pub(crate) fn new(rank: Rank, kind: RootKind) -> Result<Self> {
        // Weak and final roots cannot be deferred behind a barrier, so they
        // are not supported; see the flip protocol.
        if rank > Rank::Exact {
            return Err(GcError::Param);
        }
        Ok(Self {
            rank,
            kind,
            grey: TraceSet::EMPTY,
        })
    }
}

/// Make the root grey for a trace, so the flip scans it.
///
/// Roots are unprotectable, so their summary is universal and every root
/// greys for every trace with a non-empty white set.
pub(crate) fn grey(inner: &mut ArenaInner, rid: RootId, trace: TraceId) {
    if let Some(root) = inner.roots.get_mut(rid.0) {
        root.grey = root.grey.add(trace);
    }
}

/// Scan one root, fixing each reference it holds.
pub(crate) fn scan(inner: &mut ArenaInner, ss: &mut ScanState, rid: RootId) -> Result<()> {
    let Some(root) = inner.roots.get(rid.0) else {
        return Err(GcError::Param);
    };
    let kind = root.kind;
    let traces = ss.traces;

    match kind {
        RootKind::Table { base, count, mask } => {
            ss.scanned_size += count * (WORD_WIDTH / 8);
            let mut ctx = ScanCtx {
                inner: &mut *inner,
                ss,
            };
            for i in 0..count {
                let slot = base + i * (WORD_WIDTH / 8);
                // SAFETY: the client guarantees the table outlives the root
                // registration; slots are word-aligned by construction.
                let mut r = unsafe { arith::load_ref(slot) };
                if let Some(mask) = mask {
                    if r & mask != 0 {
                        continue;
                    }
                }
                let old = r;
                ctx.fix(&mut r)?;
                if r != old {
                    unsafe { arith::store_ref(slot, r) };
                }
            }
        }
        RootKind::Thread(tid) => {
            let Some(entry) = inner.threads.get(tid.0) else {
                return Err(GcError::Param);
            };
            let cold = entry.cold_end;
            let hot = thread::stack_hot();
            if hot >= cold {
                return Ok(());
            }
            ss.scanned_size += cold - hot;
            let mut ctx = ScanCtx {
                inner: &mut *inner,
                ss,
            };
            let mut slot = hot;
            while slot < cold {
                // SAFETY: [hot, cold) is the registered live stack span of
                // the thread currently inside the arena.
                let mut r = unsafe { arith::load_ref(slot) };
                let old = r;
                ctx.fix(&mut r)?;
                // Ambiguous slots are never updated.
                debug_assert_eq!(r, old);
                slot += WORD_WIDTH / 8;
            }
        }
        RootKind::Callback { scan, closure } => {
            let mut ctx = ScanCtx {
                inner: &mut *inner,
                ss,
            };
            scan(&mut ctx, closure)?;
        }
    }

    if let Some(root) = inner.roots.get_mut(rid.0) {
        root.grey = root.grey.diff(traces);
    }
    Ok(())
}
