//! Incremental collection: chain thresholds, stepping, and ramp patterns.

mod common;

use common::{alloc_obj, format, OBJ_SIZE};
use loam_gc::{
    AllocPattern, AllocPoint, AmsOptions, Arena, ArenaOptions, GenParams, Message, MessageKind,
    Rank,
};

fn drain_steps(arena: &Arena) {
    // Bound the loop; a collection is a few segments of work.
    for _ in 0..10_000 {
        if !arena.step(1 << 16) {
            return;
        }
    }
    panic!("collection failed to terminate");
}

#[test]
fn chain_threshold_starts_a_collection() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let chain = arena
        .chain_create(&[GenParams {
            capacity: 8 * 1024,
            mortality: 0.8,
        }])
        .unwrap();
    let pool = arena
        .pool_create_ams(AmsOptions::new(format()).chain(chain, 0))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    // Allocate past the generation capacity; the allocation polls (or a
    // later step) start a chain-threshold collection.
    for _ in 0..(16 * 1024 / OBJ_SIZE) {
        alloc_obj(&mut ap, 0);
    }
    drain_steps(&arena);

    let mut saw_start = false;
    while let Some(message) = arena.message_poll() {
        if let Message::CollectionStart { reason, .. } = message {
            assert_eq!(reason.as_str(), "chain threshold");
            saw_start = true;
        }
    }
    assert!(saw_start, "no chain-threshold collection started");
}

#[test]
fn stepping_drives_a_started_collection_to_completion() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let keep = [alloc_obj(&mut ap, 0)];
    for _ in 0..500 {
        alloc_obj(&mut ap, 0);
    }
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, keep.as_ptr() as usize, 1)
            .unwrap()
    };

    arena.start_collect().unwrap();
    assert_eq!(arena.message_peek(), Some(MessageKind::CollectionStart));
    drain_steps(&arena);

    arena.message_discard();
    match arena.message_poll() {
        Some(Message::Collection { live, .. }) => assert_eq!(live, OBJ_SIZE),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn ramp_pattern_defers_condemnation() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let chain = arena
        .chain_create(&[GenParams {
            capacity: 4 * 1024,
            mortality: 0.8,
        }])
        .unwrap();
    let pool = arena
        .pool_create_ams(AmsOptions::new(format()).chain(chain, 0))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    ap.pattern_begin(AllocPattern::Ramp).unwrap();
    for _ in 0..(12 * 1024 / OBJ_SIZE) {
        alloc_obj(&mut ap, 0);
    }
    // Over capacity, but the active ramp defers the generation.
    assert!(!arena.step(1 << 16));
    assert_eq!(arena.message_peek(), None);

    ap.pattern_end(AllocPattern::Ramp).unwrap();
    assert!(arena.step(1 << 16));
    drain_steps(&arena);
    assert_eq!(arena.message_peek(), Some(MessageKind::CollectionStart));

    // Unbalanced pattern ends are rejected.
    assert!(ap.pattern_end(AllocPattern::Ramp).is_err());
}

#[test]
fn nested_ramp_stays_active_until_the_outer_end() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let chain = arena
        .chain_create(&[GenParams {
            capacity: 4 * 1024,
            mortality: 0.8,
        }])
        .unwrap();
    let pool = arena
        .pool_create_ams(AmsOptions::new(format()).chain(chain, 0))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    ap.pattern_begin(AllocPattern::Ramp).unwrap();
    ap.pattern_begin(AllocPattern::Ramp).unwrap();
    for _ in 0..(12 * 1024 / OBJ_SIZE) {
        alloc_obj(&mut ap, 0);
    }
    ap.pattern_end(AllocPattern::Ramp).unwrap();
    assert!(!arena.step(1 << 16), "inner end must not re-arm the policy");
    ap.pattern_end(AllocPattern::Ramp).unwrap();
    assert!(arena.step(1 << 16));
    drain_steps(&arena);
}
