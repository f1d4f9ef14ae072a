//! Client object formats.
//!
//! The collector knows nothing about object layout; a pool is created with a
//! format the client registers. The contract:
//!
//! - `scan(ctx, base, limit)` walks every candidate reference in the object
//!   area `[base, limit)` and passes each through [`ScanCtx::fix`],
//!   storing back any updated value.
//! - `skip(addr)` returns the address one past the object at `addr`; it must
//!   be monotone and total over live objects and padding.
//! - `pad(addr, size)` writes a self-describing padding object of exactly
//!   `size` bytes at `addr`; `skip` must step over it.
//! - `forward`/`is_forwarded` support moving pools and may be omitted for
//!   the non-moving classes.
//!
//! Addresses handed to the client are *client* addresses: `header_size`
//! bytes past the raw grain address for headered formats.
//!
//! [`ScanCtx::fix`]: crate::ScanCtx::fix

use crate::arith::Addr;
use crate::error::Result;
use crate::trace::ScanCtx;

/// Area scanner: fix every candidate reference in `[base, limit)`.
pub type AreaScanFn = fn(&mut ScanCtx<'_>, Addr, Addr) -> Result<()>;

/// Object stepper: address one past the object at `addr`.
pub type SkipFn = fn(Addr) -> Addr;

/// Padding writer: emit a parseable filler object of exactly `size` bytes.
pub type PadFn = fn(Addr, usize);

/// Install a forwarding marker at `old` pointing to `new`.
pub type ForwardFn = fn(Addr, Addr);

/// If the object at `addr` has been forwarded, return the new address.
pub type IsForwardedFn = fn(Addr) -> Option<Addr>;

/// A client-registered object format.
#[derive(Clone, Copy)]
pub struct Format {
    /// Object alignment; becomes the pool's grain size.
    pub align: usize,
    /// Bytes of header before the client address of each object.
    pub header_size: usize,
    /// Area scanner.
    pub scan: AreaScanFn,
    /// Object stepper.
    pub skip: SkipFn,
    /// Padding writer.
    pub pad: PadFn,
    /// Forwarding installer, for moving pools.
    pub forward: Option<ForwardFn>,
    /// Forwarding test, for moving pools.
    pub is_forwarded: Option<IsForwardedFn>,
}

impl Format {
    /// Create a format for a non-moving headerless layout.
    #[must_use]
    pub fn new(align: usize, scan: AreaScanFn, skip: SkipFn, pad: PadFn) -> Self {
        Self {
            align,
            header_size: 0,
            scan,
            skip,
            pad,
            forward: None,
            is_forwarded: None,
        }
    }

    /// Set the header size for headered formats.
    #[must_use]
    pub fn with_header_size(mut self, header_size: usize) -> Self {
        self.header_size = header_size;
        self
    }

    /// Attach forwarding support for moving pools.
    #[must_use]
    pub fn with_forwarding(mut self, forward: ForwardFn, is_forwarded: IsForwardedFn) -> Self {
        self.forward = Some(forward);
        self.is_forwarded = Some(is_forwarded);
        self
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Format")
            .field("align", &self.align)
            .field("header_size", &self.header_size)
            .field("moving", &self.forward.is_some())
            .finish()
    }
}
