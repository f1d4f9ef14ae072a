//! SNC lightweight allocation frames.

mod common;

use common::{alloc_obj, format, OBJ_SIZE};
use loam_gc::{AllocPoint, Arena, ArenaOptions, Rank, SncOptions};

const SEG: usize = 64 * 1024;

#[test]
fn frame_pop_across_segments_returns_them_to_the_free_list() {
    let arena = Arena::new(ArenaOptions::new(4 << 20)).unwrap();
    let pool = arena
        .pool_create_snc(SncOptions::new(format()).extend_by(SEG))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let outer = ap.frame_push().unwrap();

    // 100 KiB of objects spans two 64 KiB segments.
    for _ in 0..(100 * 1024 / OBJ_SIZE) {
        alloc_obj(&mut ap, 0);
    }
    let committed_high = arena.committed();
    assert_eq!(committed_high, 2 * SEG);

    let inner = ap.frame_push().unwrap();
    for _ in 0..(10 * 1024 / OBJ_SIZE) {
        alloc_obj(&mut ap, 0);
    }

    // Popping the inner frame puts allocation back at the marker.
    ap.frame_pop(inner).unwrap();
    let next = alloc_obj(&mut ap, 0);
    let again = ap.frame_push().unwrap();
    ap.frame_pop(again).unwrap();
    let _ = next;

    // Popping the outer frame (bottom of stack) frees both segments to the
    // pool free list; the arena keeps them committed for reuse.
    ap.frame_pop(outer).unwrap();
    assert_eq!(arena.committed(), committed_high);

    // A 32 KiB burst reuses a freed segment: no fresh segment allocation.
    for _ in 0..(32 * 1024 / OBJ_SIZE) {
        alloc_obj(&mut ap, 0);
    }
    assert_eq!(arena.committed(), committed_high);
}

#[test]
fn push_alloc_pop_round_trips_the_window() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena
        .pool_create_snc(SncOptions::new(format()).extend_by(SEG))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    // Prime the buffer so the frame marker is a real address.
    let first = alloc_obj(&mut ap, 0);
    let frame = ap.frame_push().unwrap();
    for _ in 0..50 {
        alloc_obj(&mut ap, 0);
    }
    ap.frame_pop(frame).unwrap();

    // Allocation resumes exactly at the marker.
    let next = alloc_obj(&mut ap, 0);
    assert_eq!(next, first + OBJ_SIZE);
}

#[test]
fn frames_are_unsupported_outside_snc() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena
        .pool_create_ams(loam_gc::AmsOptions::new(format()))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();
    assert!(matches!(ap.frame_push(), Err(loam_gc::GcError::Unimpl)));
}
