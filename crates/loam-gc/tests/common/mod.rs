//! Shared test fixture: a two-word object format.
//!
//! Objects are 16 bytes: word 0 is a reference slot (zero for none), word 1
//! is scratch. Padding objects carry their size tagged with the low bit, so
//! `skip` can parse any formatted area.

#![allow(dead_code)]

use loam_gc::{Addr, AllocPoint, Format, Result, ScanCtx};

pub const OBJ_SIZE: usize = 16;

pub fn obj_scan(ctx: &mut ScanCtx<'_>, base: Addr, limit: Addr) -> Result<()> {
    let mut p = base;
    while p < limit {
        let w0 = unsafe { *(p as *const usize) };
        if w0 & 1 == 1 {
            // Padding: the tagged word is the pad size.
            p += w0 & !1;
            continue;
        }
        if w0 != 0 {
            let mut r = w0;
            ctx.fix(&mut r)?;
            if r != w0 {
                unsafe { *(p as *mut usize) = r };
            }
        }
        p += OBJ_SIZE;
    }
    Ok(())
}

pub fn obj_skip(addr: Addr) -> Addr {
    let w0 = unsafe { *(addr as *const usize) };
    if w0 & 1 == 1 {
        addr + (w0 & !1)
    } else {
        addr + OBJ_SIZE
    }
}

pub fn obj_pad(addr: Addr, size: usize) {
    unsafe { *(addr as *mut usize) = size | 1 };
}

pub fn format() -> Format {
    Format::new(OBJ_SIZE, obj_scan, obj_skip, obj_pad)
}

/// Allocate one object whose reference slot holds `r`, retrying commits
/// that trip on a flip.
pub fn alloc_obj(ap: &mut AllocPoint, r: Addr) -> Addr {
    loop {
        let base = ap.reserve(OBJ_SIZE).expect("reserve failed");
        unsafe {
            *(base as *mut usize) = r;
            *((base + 8) as *mut usize) = 0;
        }
        if ap.commit(base, OBJ_SIZE) {
            return base;
        }
    }
}

/// Read an object's reference slot.
pub fn read_slot(obj: Addr) -> Addr {
    unsafe { *(obj as *const usize) }
}

/// Write an object's reference slot.
pub fn write_slot(obj: Addr, r: Addr) {
    unsafe { *(obj as *mut usize) = r };
}
