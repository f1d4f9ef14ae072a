//! Low-level virtual memory services.
//!
//! This crate isolates the platform interface needed by a memory manager
//! that reserves a large contiguous address range up front and then commits,
//! decommits, and protects grain-aligned spans inside it:
//!
//! - [`Reservation`]: a contiguous range of reserved (inaccessible,
//!   uncommitted) address space, unmapped on drop.
//! - [`commit`] / [`decommit`]: make a span inside a reservation usable
//!   (backed) or return it to the OS.
//! - [`protect`]: change the page protection of a committed span.
//!
//! All spans must be aligned to [`page_size`]. Reservations are aligned to
//! [`allocation_granularity`], which on Windows is coarser than a page.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the coarsest alignment the OS imposes on reservations.
///
/// On Windows this is the allocation granularity (typically 64KB); on Unix
/// it is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Page protection for a committed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access; reads and writes fault.
    None,
    /// Read-only; writes fault.
    Read,
    /// Full access.
    ReadWrite,
}

/// A contiguous reserved address range.
///
/// The range is reserved but not committed: touching it faults until a span
/// is passed to [`commit`]. The whole range is unmapped when the handle is
/// dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Reserve `len` bytes of address space, optionally near `hint_addr`.
    ///
    /// The hint is a request only; the OS may place the range elsewhere.
    /// Pass 0 for no preference.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the reservation cannot be made, or
    /// `InvalidInput` if `len` is zero.
    pub fn new(len: usize, hint_addr: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        let inner = os::ReservationInner::reserve(hint_addr, len)?;
        Ok(Self { inner })
    }

    /// Base address of the reserved range.
    pub fn base(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the reserved range in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the reservation is empty (never true for a live handle).
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Whether `addr` lies inside the reserved range.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base() as usize;
        addr >= base && addr < base + self.len()
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Commit a span of a reservation, making it readable and writable.
///
/// `addr` and `len` must be page-aligned and lie inside a live reservation.
///
/// # Errors
///
/// Returns the OS error if backing store cannot be provided.
///
/// # Safety
///
/// The span must lie within a reservation owned by the caller. Committing
/// unrelated address space is undefined behaviour at the program level even
/// where the OS permits it.
pub unsafe fn commit(addr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { os::commit(addr, len) }
}

/// Decommit a span, discarding its contents and returning backing store.
///
/// The span becomes inaccessible again, as if freshly reserved.
///
/// # Errors
///
/// Returns the OS error on failure.
///
/// # Safety
///
/// The span must be a committed part of a reservation owned by the caller,
/// with no live references into it.
pub unsafe fn decommit(addr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { os::decommit(addr, len) }
}

/// Set the protection of a committed span.
///
/// # Errors
///
/// Returns the OS error on failure.
///
/// # Safety
///
/// The span must be a committed part of a reservation owned by the caller.
/// Revoking access while references into the span are live and used will
/// fault.
pub unsafe fn protect(addr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    unsafe { os::protect(addr, len, prot) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "page size should be a power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert_eq!(ag & (ag - 1), 0);
    }

    #[test]
    fn test_reserve_commit_rw() {
        let len = allocation_granularity() * 4;
        let r = Reservation::new(len, 0).expect("reserve failed");
        assert!(!r.base().is_null());
        assert_eq!(r.len(), len);
        assert_eq!(r.base() as usize % allocation_granularity(), 0);

        let span = page_size();
        unsafe {
            commit(r.base(), span).expect("commit failed");
            ptr::write_volatile(r.base(), 42);
            assert_eq!(ptr::read_volatile(r.base()), 42);
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        let len = allocation_granularity() * 2;
        let r = Reservation::new(len, 0).expect("reserve failed");
        let span = page_size();
        unsafe {
            commit(r.base(), span).expect("commit failed");
            ptr::write_volatile(r.base(), 7);
            decommit(r.base(), span).expect("decommit failed");
            // Recommitted memory must read as zero.
            commit(r.base(), span).expect("recommit failed");
            assert_eq!(ptr::read_volatile(r.base()), 0);
        }
    }

    #[test]
    fn test_protect_read_only_round_trip() {
        let len = allocation_granularity();
        let r = Reservation::new(len, 0).expect("reserve failed");
        let span = page_size();
        unsafe {
            commit(r.base(), span).expect("commit failed");
            ptr::write_volatile(r.base(), 9);
            protect(r.base(), span, Protection::Read).expect("protect failed");
            // Reads must still work under read-only protection.
            assert_eq!(ptr::read_volatile(r.base()), 9);
            protect(r.base(), span, Protection::ReadWrite).expect("unprotect failed");
            ptr::write_volatile(r.base(), 10);
            assert_eq!(ptr::read_volatile(r.base()), 10);
        }
    }

    #[test]
    fn test_contains() {
        let len = allocation_granularity();
        let r = Reservation::new(len, 0).expect("reserve failed");
        let base = r.base() as usize;
        assert!(r.contains(base));
        assert!(r.contains(base + len - 1));
        assert!(!r.contains(base + len));
        assert!(!r.contains(0));
    }

    #[test]
    fn test_reserve_with_hint() {
        // Heuristic: the hint may or may not be honoured, but the call must
        // produce usable memory either way.
        #[cfg(target_pointer_width = "64")]
        let hint = 0x6000_0000_0000usize;
        #[cfg(target_pointer_width = "32")]
        let hint = 0x4000_0000usize;

        let len = allocation_granularity();
        if let Ok(r) = Reservation::new(len, hint) {
            unsafe {
                commit(r.base(), page_size()).expect("commit failed");
                ptr::write_volatile(r.base(), 1);
                assert_eq!(ptr::read_volatile(r.base()), 1);
            }
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(Reservation::new(0, 0).is_err());
    }
}
