//! An incremental, generational, precise garbage collector for embedding.
//!
//! `loam-gc` manages pools of memory inside a single reserved arena. The
//! collector knows object layout only through a registered [`Format`]; each
//! pool has a collection policy, and collection work runs incrementally on
//! mutator time slices, cooperating with the mutator through allocation
//! points and memory-protection barriers.
//!
//! # Pool classes
//!
//! - **AMS** — automatic mark-and-sweep over per-grain bit tables, with a
//!   debug variant that splats and checks freed storage.
//! - **AWL** — AMS plus the weak rank: dead weak referents are *splatted*
//!   (zeroed), and barrier hits can be serviced by budgeted
//!   single-reference scans.
//! - **SNC** — a stack allocator with lightweight allocation frames; never
//!   collected, popped explicitly.
//!
//! # Quick start
//!
//! ```ignore
//! use loam_gc::{AllocPoint, Arena, ArenaOptions, AmsOptions, Format, Rank};
//!
//! let arena = Arena::new(ArenaOptions::new(1 << 20))?;
//! let pool = arena.pool_create_ams(AmsOptions::new(MY_FORMAT))?;
//! let mut ap = AllocPoint::create(&arena, pool, Rank::Exact)?;
//!
//! // Two-phase allocation: reserve, initialize, commit; retry on a flip.
//! let obj = loop {
//!     let base = ap.reserve(16)?;
//!     init_my_object(base);
//!     if ap.commit(base, 16) {
//!         break base;
//!     }
//! };
//! # Ok::<(), loam_gc::GcError>(())
//! ```
//!
//! # Concurrency model
//!
//! The arena is a single serialized region: every public operation enters
//! it exclusively. Allocation-point fast paths run outside the lock and
//! synchronize with collection flips through an atomic trap.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod arith;
mod buffer;
mod error;
mod events;
mod format;
mod message;
mod pool;
mod root;
mod seg;
mod shield;
mod slab;
mod thread;
mod trace;
mod walk;
mod zone;

/// Packed bit tables with word-parallel range operations.
///
/// Public for testing and for clients building grain-indexed side tables.
pub mod bt;

pub use arena::{Arena, ArenaOptions, CollectReason};
pub use buffer::{AllocPattern, AllocPoint, FrameMarker};
pub use error::{GcError, Result};
pub use events::TraceSerial;
pub use format::{
    AreaScanFn, Format, ForwardFn, IsForwardedFn, PadFn, SkipFn,
};
pub use message::{Message, MessageKind};
pub use pool::{
    AmsOptions, AwlOptions, ChainId, DebugOptions, FindDependentFn, GenParams, PoolClassId,
    PoolId, SncOptions,
};
pub use root::{RootId, RootScanFn};
pub use seg::{AccessSet, Rank, RankSet};
pub use thread::ThreadId;
pub use trace::ScanCtx;
pub use walk::AreaWalkFn;
pub use zone::ZoneSet;

/// The collector's address type: a machine-pointer-sized integer.
pub use arith::Addr;
/// A machine word.
pub use arith::Word;
