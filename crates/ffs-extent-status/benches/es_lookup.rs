#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ffs_extent_status::{EsConfig, EsStatus, ExtentStatusCache, InodeEsTree};
use ffs_types::InodeNumber;

const RECORDS: u32 = 4096;

/// Alternating Written/Delayed runs of 8 blocks so nothing merges.
fn populated(cache: &ExtentStatusCache) -> InodeEsTree {
    let tree = cache.open_tree(InodeNumber(12));
    for i in 0..RECORDS {
        let status = if i % 2 == 0 {
            EsStatus::Written
        } else {
            EsStatus::Delayed
        };
        tree.insert_extent(i * 8, 8, u64::from(i) * 1024, status)
            .expect("populate");
    }
    tree
}

fn bench_lookup(c: &mut Criterion) {
    let cache = ExtentStatusCache::new(EsConfig::default());
    let tree = populated(&cache);

    c.bench_function("es_lookup_sequential_mru", |b| {
        let mut lblk = 0_u32;
        b.iter(|| {
            lblk = (lblk + 1) % (RECORDS * 8);
            black_box(tree.lookup_extent(black_box(lblk)))
        });
    });

    c.bench_function("es_lookup_strided", |b| {
        let mut lblk = 0_u32;
        b.iter(|| {
            lblk = (lblk + 8 * 97) % (RECORDS * 8);
            black_box(tree.lookup_extent(black_box(lblk)))
        });
    });

    c.bench_function("es_find_delayed_range", |b| {
        let mut lblk = 0_u32;
        b.iter(|| {
            lblk = (lblk + 8 * 31) % (RECORDS * 8);
            black_box(tree.find_delayed_extent_range(black_box(lblk), lblk + 64))
        });
    });
}

fn bench_mutation(c: &mut Criterion) {
    c.bench_function("es_insert_split_remove", |b| {
        let cache = ExtentStatusCache::new(EsConfig::default());
        let tree = populated(&cache);
        let mut i = 0_u32;
        b.iter(|| {
            i = (i + 1) % RECORDS;
            let lblk = i * 8;
            tree.remove_extent(lblk + 2, 3).expect("split");
            tree.insert_extent(lblk, 8, u64::from(i) * 1024, EsStatus::Unwritten)
                .expect("overwrite");
        });
    });

    c.bench_function("es_shrink_batch", |b| {
        b.iter_batched(
            || {
                let cache = ExtentStatusCache::new(EsConfig::default());
                let tree = populated(&cache);
                (cache, tree)
            },
            |(cache, tree)| {
                black_box(cache.shrink(512));
                drop(tree);
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(es, bench_lookup, bench_mutation);
criterion_main!(es);
