//! Benchmark: first-fit scans over a fragmented bitmap.
//!
//! The allocator skips fully-used bytes; this measures how much that helps
//! on a mostly-full image versus a sparse one.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sfs_alloc::{bitmap_count_free, bitmap_first_free};

const BITS: u64 = 25_600;

/// Mostly-full bitmap with a 16-block hole every ~700 blocks.
fn fragmented() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; (BITS / 8) as usize];
    let mut pos = 1_700_u64;
    while pos + 16 < BITS {
        for i in pos..pos + 16 {
            bm[(i / 8) as usize] &= !(1 << (i % 8));
        }
        pos += 700;
    }
    bm
}

fn bench_first_free(c: &mut Criterion) {
    let full = fragmented();
    let empty = vec![0_u8; (BITS / 8) as usize];

    let mut group = c.benchmark_group("first_free");
    group.bench_function("fragmented_64", |b| {
        b.iter(|| black_box(bitmap_first_free(black_box(&full), 1_691, BITS, 64)));
    });
    group.bench_function("empty_64", |b| {
        b.iter(|| black_box(bitmap_first_free(black_box(&empty), 1_691, BITS, 64)));
    });
    group.finish();
}

fn bench_count_free(c: &mut Criterion) {
    let full = fragmented();
    c.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&full), BITS)));
    });
}

criterion_group!(benches, bench_first_free, bench_count_free);
criterion_main!(benches);
