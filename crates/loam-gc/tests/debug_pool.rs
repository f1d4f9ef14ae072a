//! AMS debug class: free splatting and free checking.

mod common;

use common::{alloc_obj, format};
use loam_gc::{AllocPoint, AmsOptions, Arena, ArenaOptions, DebugOptions, Rank};

#[test]
fn reclaimed_storage_is_splatted() {
    let arena = Arena::new(ArenaOptions::new(1 << 20)).unwrap();
    let pool = arena
        .pool_create_ams(AmsOptions::new(format()).debug(DebugOptions {
            splat_pattern: 0x5D,
            free_check: true,
        }))
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    let keep = [alloc_obj(&mut ap, 0)];
    let dead = alloc_obj(&mut ap, 0);
    let _root = unsafe {
        arena
            .root_create_table(Rank::Exact, keep.as_ptr() as usize, 1)
            .unwrap()
    };

    arena.collect().unwrap();

    // The dead object's storage now carries the splat pattern.
    let bytes = unsafe { std::slice::from_raw_parts(dead as *const u8, common::OBJ_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0x5D), "dead storage not splatted");

    // The survivor is untouched.
    assert_eq!(common::read_slot(keep[0]), 0);

    // Another cycle runs the free check over the splatted storage; it
    // passes because nothing wrote to free space.
    arena.collect().unwrap();

    // Reuse the splatted storage and collect again: the check must accept
    // storage that was legitimately reallocated.
    let fresh = alloc_obj(&mut ap, 0);
    assert!(arena.has_addr(fresh));
    arena.collect().unwrap();
}
