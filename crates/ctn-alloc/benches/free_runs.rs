//! Benchmark: run-based free-bit counting vs a per-bit popcount.
//!
//! `count_free_runs` is what chain validation uses for every group
//! descriptor; the popcount variant is the obvious alternative.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ctn_alloc::{bitmap_get, count_free_runs};

/// A 4 KiB-block group bitmap (32256 bits), ~5% free in short runs.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 4032];
    let mut pos = 100_usize;
    while pos + 32 < 32256 {
        for i in pos..pos + 32 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 650;
    }
    bm
}

fn per_bit(bm: &[u8], bits: u32) -> u32 {
    (0..bits).filter(|&idx| !bitmap_get(bm, idx)).count() as u32
}

fn bench_free_count(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("free_count");

    group.bench_function("runs", |b| {
        b.iter(|| black_box(count_free_runs(black_box(&bm), 32256)));
    });

    group.bench_function("per_bit", |b| {
        b.iter(|| black_box(per_bit(black_box(&bm), 32256)));
    });

    group.finish();
}

fn bench_sparse(c: &mut Criterion) {
    let mut bm = vec![0_u8; 4032];
    bm[0] = 1;
    c.bench_function("free_count_mostly_free", |b| {
        b.iter(|| black_box(count_free_runs(black_box(&bm), 32256)));
    });
}

criterion_group!(benches, bench_free_count, bench_sparse);
criterion_main!(benches);
