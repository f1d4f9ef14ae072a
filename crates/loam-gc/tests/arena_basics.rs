//! Address membership, allocation boundaries, roots, and restructuring.

mod common;

use common::{alloc_obj, format, obj_pad, read_slot};
use loam_gc::{AllocPoint, AmsOptions, Arena, ArenaOptions, GcError, Rank, Word};

#[test]
fn address_membership() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    assert!(!arena.has_addr(0));

    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();
    let obj = alloc_obj(&mut ap, 0);

    assert!(arena.has_addr(obj));
    assert!(arena.has_addr(obj + 8));
    let stack_local = 0usize;
    assert!(!arena.has_addr(&stack_local as *const usize as usize));
}

#[test]
fn allocation_boundaries() {
    let arena = Arena::new(ArenaOptions::new(1 << 20).grain_size(4096)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    // Size zero is a parameter error.
    assert!(matches!(ap.reserve(0), Err(GcError::Param)));

    // A whole-segment object: write it as padding so every parse is happy.
    let base = ap.reserve(4096).unwrap();
    obj_pad(base, 4096);
    assert!(ap.commit(base, 4096));

    // Bigger than the whole arena: out of managed memory.
    assert!(matches!(ap.reserve(2 << 20), Err(GcError::Memory)));

    // The arena stays consistent and usable after the failure.
    let obj = alloc_obj(&mut ap, 0);
    assert!(arena.has_addr(obj));
}

#[test]
fn commit_limit_is_enforced() {
    let arena = Arena::new(ArenaOptions::new(1 << 20).commit_limit(8 * 1024)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let _a = ap.reserve(4096).unwrap();
    // Leave the first buffer unfinished; a second segment would pass the
    // limit check, a third cannot.
    assert!(arena.committed() <= 8 * 1024);
    let err = loop {
        match ap.reserve(8 * 1024) {
            Ok(base) => {
                obj_pad(base, 8 * 1024);
                ap.commit(base, 8 * 1024);
            }
            Err(e) => break e,
        }
    };
    assert!(matches!(err, GcError::Limit));
}

#[test]
fn masked_table_ignores_tagged_words() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let keep = alloc_obj(&mut ap, 0);
    let drop_me = alloc_obj(&mut ap, 0);

    // The tagged entry is not a reference and must not retain its target.
    let table: [Word; 2] = [keep, drop_me | 1];
    let _root = unsafe {
        arena
            .root_create_table_masked(Rank::Exact, table.as_ptr() as usize, 2, 1)
            .unwrap()
    };

    arena.collect().unwrap();

    arena.park();
    let mut visited = Vec::new();
    arena
        .formatted_objects_walk(|addr, _| visited.push(addr))
        .unwrap();
    assert_eq!(visited, vec![keep]);
}

/// Run `f` in a frame strictly below a stack marker, so every local of `f`
/// lies inside the registered stack span.
#[inline(never)]
fn with_stack_cold_end(f: impl FnOnce(usize)) {
    let marker = 0usize;
    let cold_end = std::hint::black_box(&marker as *const usize as usize);
    f(cold_end);
}

#[test]
fn thread_stack_is_an_ambiguous_root() {
    with_stack_cold_end(|cold_end| {
        let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
        let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
        let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

        let tid = unsafe { arena.thread_register(cold_end) };
        let _root = arena.root_create_thread(tid).unwrap();

        let obj = alloc_obj(&mut ap, 0);
        common::write_slot(obj + 8, 0x1234_5678);
        // Keep the reference in stack memory where the conservative scan
        // can see it.
        let keep = [obj];
        std::hint::black_box(&keep);

        arena.collect().unwrap();

        // The object survived the collection with its contents intact.
        assert!(arena.has_addr(keep[0]));
        assert_eq!(unsafe { *((keep[0] + 8) as *const usize) }, 0x1234_5678);

        arena.thread_deregister(tid).unwrap();
    });
}

fn scan_cell_root(ctx: &mut loam_gc::ScanCtx<'_>, closure: usize) -> loam_gc::Result<()> {
    let slot = closure as *mut usize;
    let mut r = unsafe { *slot };
    if r != 0 {
        ctx.fix(&mut r)?;
        unsafe { *slot = r };
    }
    Ok(())
}

#[test]
fn callback_roots_are_scanned() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let keep = alloc_obj(&mut ap, 0);
    alloc_obj(&mut ap, 0);
    let mut cell: usize = keep;
    let _root = arena
        .root_create_scan(Rank::Exact, scan_cell_root, &mut cell as *mut usize as usize)
        .unwrap();

    arena.collect().unwrap();

    arena.park();
    let mut visited = Vec::new();
    arena
        .formatted_objects_walk(|addr, _| visited.push(addr))
        .unwrap();
    assert_eq!(visited, vec![keep]);
}

#[test]
fn weak_rank_roots_are_rejected() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let table = [0usize];
    let res = unsafe { arena.root_create_table(Rank::Weak, table.as_ptr() as usize, 1) };
    assert!(matches!(res, Err(GcError::Param)));
}

#[test]
fn split_and_merge_preserve_objects() {
    let arena = Arena::new(ArenaOptions::new(1 << 20).grain_size(4096)).unwrap();
    let pool = arena
        .pool_create_ams(AmsOptions::new(format()).extend_by(8 * 1024))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let first = alloc_obj(&mut ap, 7);
    for _ in 0..10 {
        alloc_obj(&mut ap, 0);
    }
    drop(ap);

    let walk_all = |arena: &Arena| {
        let mut v = Vec::new();
        arena.formatted_objects_walk(|addr, _| v.push(addr)).unwrap();
        v
    };

    arena.park();
    let before = walk_all(&arena);

    let mid = (first & !4095) + 4096;
    arena.seg_split(mid).unwrap();
    assert_eq!(walk_all(&arena), before);

    arena.seg_merge(mid).unwrap();
    assert_eq!(walk_all(&arena), before);
    assert_eq!(read_slot(first), 7);
}
