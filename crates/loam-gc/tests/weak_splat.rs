//! Weak reference splatting in AWL.

mod common;

use common::{alloc_obj, format, read_slot, OBJ_SIZE};
use loam_gc::{AllocPoint, Arena, ArenaOptions, AwlOptions, Message, Rank};

#[test]
fn dead_weak_target_is_splatted() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_awl(AwlOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Weak).unwrap();

    // A holds the only reference to B, and holds it weakly.
    let b = alloc_obj(&mut ap, 0);
    let a = alloc_obj(&mut ap, b);
    let roots = [a];
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, roots.as_ptr() as usize, 1)
            .unwrap()
    };

    arena.collect().unwrap();

    // A's weak slot reads as zero and B's storage was recovered.
    assert_eq!(read_slot(a), 0);
    match (arena.message_poll(), arena.message_poll()) {
        (Some(Message::CollectionStart { .. }), Some(Message::Collection { live, condemned, .. })) => {
            assert_eq!(condemned, 2 * OBJ_SIZE);
            assert_eq!(live, OBJ_SIZE);
        }
        other => panic!("unexpected messages {other:?}"),
    }

    // The walker sees A but not B.
    arena.park();
    let mut visited = Vec::new();
    arena
        .formatted_objects_walk(|addr, _pool| visited.push(addr))
        .unwrap();
    assert_eq!(visited, vec![a]);
}

#[test]
fn strongly_reachable_weak_target_survives() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_awl(AwlOptions::new(format())).unwrap();
    let mut weak_ap = AllocPoint::create(&arena, pool, Rank::Weak).unwrap();
    let mut exact_ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    // B is strongly reachable through S; A references B weakly.
    let b = alloc_obj(&mut exact_ap, 0);
    let s = alloc_obj(&mut exact_ap, b);
    let a = alloc_obj(&mut weak_ap, b);
    let roots = [a, s];
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, roots.as_ptr() as usize, 2)
            .unwrap()
    };

    arena.collect().unwrap();

    // The strong path keeps B alive, so the weak slot is intact.
    assert_eq!(read_slot(a), b);
    assert_eq!(read_slot(s), b);
}
