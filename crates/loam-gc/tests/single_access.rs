//! Barrier-provoked single-reference scans and their budgets.

mod common;

use common::{alloc_obj, format};
use loam_gc::{AccessSet, AllocPoint, Arena, ArenaOptions, AwlOptions, Rank};

fn grey_seg_count(arena: &Arena) -> usize {
    arena
        .describe_segs()
        .iter()
        .filter(|line| !line.ends_with("grey 0b0000"))
        .count()
}

#[test]
fn seg_budget_bounds_single_accesses() {
    let arena = Arena::new(ArenaOptions::new(1 << 20).barriers(false)).unwrap();
    let pool = arena
        .pool_create_awl(AwlOptions::new(format()).seg_sa_limit(4).total_sa_limit(100))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Weak).unwrap();

    // Five weak holders, each referencing its own target, all rooted so
    // the flip greys their (shared) segment.
    let mut holders = [0usize; 5];
    let mut targets = [0usize; 5];
    for i in 0..5 {
        targets[i] = alloc_obj(&mut ap, 0);
        holders[i] = alloc_obj(&mut ap, targets[i]);
    }
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, holders.as_ptr() as usize, holders.len())
            .unwrap()
    };

    // Flip a collection and leave it in progress.
    arena.start_collect().unwrap();
    assert_eq!(grey_seg_count(&arena), 1, "holders' segment should be grey");

    // The first four barrier hits are handled singly; the segment stays
    // grey throughout.
    for (i, &holder) in holders.iter().enumerate().take(4) {
        arena.access(holder, AccessSet::READ).unwrap();
        assert_eq!(
            grey_seg_count(&arena),
            1,
            "segment must stay grey after single access {i}"
        );
    }

    // The fifth hit exceeds the per-segment budget and forces a
    // whole-segment scan; the segment goes black.
    arena.access(holders[4], AccessSet::READ).unwrap();
    assert_eq!(grey_seg_count(&arena), 0, "fifth hit must scan the segment");

    // Finish the cycle.
    arena.park();
    arena.release();
}

#[test]
fn total_budget_bounds_successive_accesses() {
    let arena = Arena::new(ArenaOptions::new(1 << 20).barriers(false)).unwrap();
    let pool = arena
        .pool_create_awl(AwlOptions::new(format()).seg_sa_limit(100).total_sa_limit(2))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Weak).unwrap();

    let mut holders = [0usize; 3];
    for h in &mut holders {
        let target = alloc_obj(&mut ap, 0);
        *h = alloc_obj(&mut ap, target);
    }
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, holders.as_ptr() as usize, holders.len())
            .unwrap()
    };

    arena.start_collect().unwrap();
    assert_eq!(grey_seg_count(&arena), 1);

    arena.access(holders[0], AccessSet::READ).unwrap();
    arena.access(holders[1], AccessSet::READ).unwrap();
    assert_eq!(grey_seg_count(&arena), 1);

    // The third successive access exhausts the pool-wide budget.
    arena.access(holders[2], AccessSet::READ).unwrap();
    assert_eq!(grey_seg_count(&arena), 0);

    arena.park();
    arena.release();
}
