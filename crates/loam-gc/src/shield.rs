//! The shield: deferred page protection over segments.
//!
//! The collector expresses *desired* protection per segment (derived from
//! rank/color state); the shield mediates between desired and *effective*
//! page protection so that protection syscalls are batched. While a segment
//! is exposed the collector may read and write it freely; covering queues
//! the reinstatement, and the queue is flushed when it fills or when the
//! arena is left.

use crate::arena::ArenaInner;
use crate::seg::{AccessSet, SegId};

/// Bound on the deferred-protection queue.
pub(crate) const QUEUE_MAX: usize = 16;

#[derive(Default)]
pub(crate) struct ShieldQueue {
    pending: Vec<SegId>,
}

impl ShieldQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::with_capacity(QUEUE_MAX),
        }
    }
}

fn prot_for(denied: AccessSet) -> sys_vm::Protection {
    // Stock hardware cannot deny reads while allowing writes, so a READ
    // denial implies denying everything.
    if denied.contains(AccessSet::READ) {
        sys_vm::Protection::None
    } else if denied.contains(AccessSet::WRITE) {
        sys_vm::Protection::Read
    } else {
        sys_vm::Protection::ReadWrite
    }
}

/// Realize `denied` as the segment's page protection, now.
fn apply(inner: &mut ArenaInner, sid: SegId, denied: AccessSet) {
    let (base, size) = {
        let seg = inner.seg(sid);
        (seg.base, seg.size())
    };
    if inner.barriers {
        // The span was committed at placement; failure here means the OS
        // rescinded it, which the collector cannot recover from.
        unsafe {
            sys_vm::protect(base as *mut u8, size, prot_for(denied))
                .expect("page protection change failed");
        }
    }
    inner.seg_mut(sid).shield.effective = denied;
}

/// Raise a denial on a segment (collector wants the mutator kept out).
pub(crate) fn raise(inner: &mut ArenaInner, sid: SegId, mode: AccessSet) {
    let desired = inner.seg(sid).shield.desired | mode;
    set_desired(inner, sid, desired);
}

/// Lower a denial on a segment.
pub(crate) fn lower(inner: &mut ArenaInner, sid: SegId, mode: AccessSet) {
    let desired = inner.seg(sid).shield.desired - mode;
    set_desired(inner, sid, desired);
}

fn set_desired(inner: &mut ArenaInner, sid: SegId, desired: AccessSet) {
    {
        let shield = &mut inner.seg_mut(sid).shield;
        if shield.desired == desired {
            return;
        }
        shield.desired = desired;
    }
    let shield = inner.seg(sid).shield;
    if shield.depth > 0 {
        // Exposed: protection stays lifted; cover will reconcile.
        return;
    }
    if shield.effective != desired {
        enqueue(inner, sid);
    }
}

/// Begin collector access to a segment; protection is lifted while exposed.
/// Nesting is by depth counter.
pub(crate) fn expose(inner: &mut ArenaInner, sid: SegId) {
    let effective = {
        let shield = &mut inner.seg_mut(sid).shield;
        shield.depth += 1;
        shield.effective
    };
    if !effective.is_empty() {
        apply(inner, sid, AccessSet::empty());
    }
}

/// End collector access; the desired protection is queued for reinstatement.
pub(crate) fn cover(inner: &mut ArenaInner, sid: SegId) {
    let shield = &mut inner.seg_mut(sid).shield;
    debug_assert!(shield.depth > 0, "cover without matching expose");
    shield.depth -= 1;
    if shield.depth == 0 && shield.effective != shield.desired {
        enqueue(inner, sid);
    }
}

fn enqueue(inner: &mut ArenaInner, sid: SegId) {
    if inner.seg(sid).shield.queued {
        return;
    }
    inner.seg_mut(sid).shield.queued = true;
    inner.shield.pending.push(sid);
    if inner.shield.pending.len() >= QUEUE_MAX {
        flush(inner);
    }
}

/// Realize all queued protections.
pub(crate) fn flush(inner: &mut ArenaInner) {
    let pending = std::mem::take(&mut inner.shield.pending);
    for sid in pending {
        // The segment may have been freed since it was queued.
        if !inner.segs.contains(sid.0) {
            continue;
        }
        inner.seg_mut(sid).shield.queued = false;
        let shield = inner.seg(sid).shield;
        if shield.depth == 0 && shield.effective != shield.desired {
            apply(inner, sid, shield.desired);
        }
    }
}

/// A scoped expose; covers the segment when dropped.
///
/// Pool scan and walk paths go through this guard so the segment is covered
/// on every exit path.
pub(crate) struct Exposed<'a> {
    inner: &'a mut ArenaInner,
    sid: SegId,
}

impl<'a> Exposed<'a> {
    pub(crate) fn new(inner: &'a mut ArenaInner, sid: SegId) -> Self {
        expose(inner, sid);
        Self { inner, sid }
    }

    pub(crate) fn inner(&mut self) -> &mut ArenaInner {
        &mut *self.inner
    }
}

impl Drop for Exposed<'_> {
    fn drop(&mut self) {
        cover(self.inner, self.sid);
    }
}
