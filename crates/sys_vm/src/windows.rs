use std::io::{self, Error};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::Protection;

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = system_info().dwPageSize as usize;
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Returns the VirtualAlloc reservation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    static GRANULARITY: AtomicUsize = AtomicUsize::new(0);

    match GRANULARITY.load(Ordering::Relaxed) {
        0 => {
            let granularity = system_info().dwAllocationGranularity as usize;
            GRANULARITY.store(granularity, Ordering::Relaxed);
            granularity
        }
        granularity => granularity,
    }
}

pub struct ReservationInner {
    ptr: *mut core::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    pub fn reserve(hint_addr: usize, len: usize) -> io::Result<ReservationInner> {
        let addr = if hint_addr == 0 {
            ptr::null()
        } else {
            hint_addr as *const core::ffi::c_void
        };

        let ptr = unsafe { VirtualAlloc(addr, len, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() {
            // The hint may be unavailable; retry with no placement request.
            let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            return Ok(ReservationInner { ptr, len });
        }

        Ok(ReservationInner { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

fn prot_bits(prot: Protection) -> u32 {
    match prot {
        Protection::None => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    }
}

pub unsafe fn commit(addr: *mut u8, len: usize) -> io::Result<()> {
    let ptr = unsafe { VirtualAlloc(addr.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub unsafe fn decommit(addr: *mut u8, len: usize) -> io::Result<()> {
    let ok = unsafe { VirtualFree(addr.cast(), len, MEM_DECOMMIT) };
    if ok == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub unsafe fn protect(addr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    let mut old = 0u32;
    let ok = unsafe { VirtualProtect(addr.cast(), len, prot_bits(prot), &mut old) };
    if ok == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
