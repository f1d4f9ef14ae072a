//! Roots walking: complete coverage without mutation.

mod common;

use std::collections::HashMap;

use common::{alloc_obj, format};
use loam_gc::{AllocPoint, AmsOptions, Arena, ArenaOptions, Rank};

#[test]
fn walk_visits_every_root_reference_once_and_mutates_nothing() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena.pool_create_ams(AmsOptions::new(format())).unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let objs: Vec<usize> = (0..8).map(|_| alloc_obj(&mut ap, 0)).collect();

    // Two roots sharing one referent, so it must be reported twice.
    let table_a: Vec<usize> = objs[..5].to_vec();
    let table_b: Vec<usize> = vec![objs[4], objs[5], objs[6]];
    let root_a = unsafe {
        arena
            .root_create_table(Rank::Exact, table_a.as_ptr() as usize, table_a.len())
            .unwrap()
    };
    let root_b = unsafe {
        arena
            .root_create_table(Rank::Exact, table_b.as_ptr() as usize, table_b.len())
            .unwrap()
    };

    arena.park();
    let before = arena.describe_segs();

    let mut seen: HashMap<(usize, u32), usize> = HashMap::new();
    arena
        .roots_walk(|r, rid| {
            let key = (r, if rid == root_a { 0 } else { 1 });
            *seen.entry(key).or_insert(0) += 1;
        })
        .unwrap();

    // Exactly one invocation per reference in each root.
    for &obj in &table_a {
        assert_eq!(seen.get(&(obj, 0)), Some(&1), "root A ref {obj:#x}");
    }
    for &obj in &table_b {
        assert_eq!(seen.get(&(obj, 1)), Some(&1), "root B ref {obj:#x}");
    }
    assert_eq!(seen.len(), table_a.len() + table_b.len());
    assert!(!seen.contains_key(&(objs[7], 0)));

    // Segment color, white, grey, and rank state are untouched.
    let after = arena.describe_segs();
    assert_eq!(before, after);

    // The heap itself is untouched: a later collection still retains
    // exactly the rooted objects.
    arena.release();
    arena.collect().unwrap();
    for &obj in objs[..7].iter() {
        assert!(arena.has_addr(obj));
    }
}

#[test]
fn walk_requires_a_parked_arena() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let res = arena.roots_walk(|_, _| {});
    assert!(matches!(res, Err(loam_gc::GcError::Fail)));
}
