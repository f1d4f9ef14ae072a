//! Mark-sweep retention through an exact root table.

mod common;

use std::collections::BTreeSet;

use common::{alloc_obj, format, OBJ_SIZE};
use loam_gc::{AllocPoint, AmsOptions, Arena, ArenaOptions, Message, MessageKind, Rank};

#[test]
fn retains_rooted_objects_and_reclaims_the_rest() {
    let arena = Arena::new(ArenaOptions::new(1 << 20).grain_size(4096)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    // 1000 objects of 16 bytes; every 10th is retained via an exact root.
    let mut retained = vec![0usize; 100].into_boxed_slice();
    let mut kept = 0;
    for i in 0..1000 {
        let obj = alloc_obj(&mut ap, 0);
        if i % 10 == 0 {
            retained[kept] = obj;
            kept += 1;
        }
    }
    assert_eq!(kept, 100);
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, retained.as_ptr() as usize, retained.len())
            .unwrap()
    };

    arena.collect().unwrap();

    // The start message precedes the completion message.
    assert_eq!(arena.message_peek(), Some(MessageKind::CollectionStart));
    match arena.message_poll().unwrap() {
        Message::CollectionStart { reason, .. } => {
            assert_eq!(reason.as_str(), "client request");
        }
        other => panic!("unexpected message {other:?}"),
    }
    match arena.message_poll().unwrap() {
        Message::Collection {
            live,
            condemned,
            not_condemned,
            ..
        } => {
            assert_eq!(condemned, 1000 * OBJ_SIZE);
            assert_eq!(live, 100 * OBJ_SIZE);
            assert_eq!(not_condemned, 0);
        }
        other => panic!("unexpected message {other:?}"),
    }

    // The walker visits exactly the retained objects.
    arena.park();
    let mut visited = BTreeSet::new();
    arena
        .formatted_objects_walk(|addr, _pool| {
            visited.insert(addr);
        })
        .unwrap();
    let expected: BTreeSet<usize> = retained.iter().copied().collect();
    assert_eq!(visited, expected);
    arena.release();

    // Subsequent allocation reuses reclaimed segments: no segment growth.
    let committed_before = arena.committed();
    for _ in 0..500 {
        alloc_obj(&mut ap, 0);
    }
    assert_eq!(arena.committed(), committed_before);
}

#[test]
fn collect_with_nothing_condemnable_is_a_no_op() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    arena.collect().unwrap();
    assert_eq!(arena.message_peek(), None);
}

#[test]
fn repeated_collections_converge() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    // A chain a -> b -> c rooted at a.
    let c = alloc_obj(&mut ap, 0);
    let b = alloc_obj(&mut ap, c);
    let a = alloc_obj(&mut ap, b);
    let roots = [a];
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, roots.as_ptr() as usize, 1)
            .unwrap()
    };
    // Unrooted garbage.
    for _ in 0..100 {
        alloc_obj(&mut ap, 0);
    }

    arena.collect().unwrap();
    while arena.message_poll().is_some() {}
    arena.collect().unwrap();

    match arena.message_poll() {
        Some(Message::CollectionStart { .. }) => {}
        other => panic!("expected a start message, got {other:?}"),
    }
    match arena.message_poll() {
        Some(Message::Collection { live, .. }) => {
            // The chain survives both cycles intact.
            assert_eq!(live, 3 * OBJ_SIZE);
        }
        other => panic!("expected a completion message, got {other:?}"),
    }
    assert_eq!(common::read_slot(a), b);
    assert_eq!(common::read_slot(b), c);
}
