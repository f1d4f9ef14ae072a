//! Allocation-point fast-path throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use loam_gc::{AllocPoint, AmsOptions, Arena, ArenaOptions, Format, Rank, ScanCtx};

const OBJ_SIZE: usize = 16;

fn scan(_ctx: &mut ScanCtx<'_>, _base: usize, _limit: usize) -> loam_gc::Result<()> {
    Ok(())
}

fn skip(addr: usize) -> usize {
    let w0 = unsafe { *(addr as *const usize) };
    if w0 & 1 == 1 {
        addr + (w0 & !1)
    } else {
        addr + OBJ_SIZE
    }
}

fn pad(addr: usize, size: usize) {
    unsafe { *(addr as *mut usize) = size | 1 };
}

fn bench_reserve_commit(c: &mut Criterion) {
    let arena = Arena::new(ArenaOptions::new(64 << 20).barriers(false)).unwrap();
    // Everything allocated here is garbage; the chain keeps the arena from
    // filling by collecting every few megabytes.
    let chain = arena
        .chain_create(&[loam_gc::GenParams {
            capacity: 8 << 20,
            mortality: 1.0,
        }])
        .unwrap();
    let pool = arena
        .pool_create_ams(
            AmsOptions::new(Format::new(OBJ_SIZE, scan, skip, pad))
                .extend_by(1 << 20)
                .chain(chain, 0),
        )
        .unwrap();
    let mut ap = AllocPoint::create(&arena, pool, Rank::Exact).unwrap();

    c.bench_function("reserve_commit_16b", |b| {
        b.iter(|| loop {
            let base = ap.reserve(OBJ_SIZE).unwrap();
            unsafe {
                *(base as *mut usize) = 0;
                *((base + 8) as *mut usize) = 0;
            }
            // A commit can trip on a collection flip; redo the object.
            if ap.commit(base, OBJ_SIZE) {
                break black_box(base);
            }
        });
    });
}

criterion_group!(benches, bench_reserve_commit);
criterion_main!(benches);
