//! Benchmark: index insert, lookup, and persistence at the default capacity.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use sfs_block::{ByteBlockDevice, MemByteDevice};
use sfs_btree::BPlusTree;
use sfs_types::BlockNumber;

const KEYS: u32 = 3000;

/// Spread keys the way hashed names spread them.
fn key(i: u32) -> u32 {
    i.wrapping_mul(2_654_435_761)
}

fn populated() -> BPlusTree {
    let mut tree = BPlusTree::new(5);
    for i in 0..KEYS {
        tree.insert(key(i), i);
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_3000", |b| {
        b.iter(|| black_box(populated()));
    });
}

fn bench_search(c: &mut Criterion) {
    let tree = populated();
    c.bench_function("search_hit", |b| {
        let mut i = 0_u32;
        b.iter(|| {
            i = (i + 1) % KEYS;
            black_box(tree.search(black_box(key(i))))
        });
    });
}

fn bench_save(c: &mut Criterion) {
    let dev = ByteBlockDevice::new(MemByteDevice::new(1024 * 4096), 4096).expect("device");
    c.bench_function("save_3000", |b| {
        b.iter_batched(
            populated,
            |mut tree| tree.save(&dev, BlockNumber(2), 939).expect("save"),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_save);
criterion_main!(benches);
