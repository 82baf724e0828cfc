use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rfs_alloc::{AgGeometry, AllocGroups};
use rfs_bmap::{map_read, Bmap, ExtState, ExtentRec, Fork, WriteFlags};
use rfs_block::{BufCache, MemBlockDevice};
use rfs_trans::{FsCounters, TxnManager};
use rfs_types::{DiskBlock, FileBlock, ForkKind, Pool};
use std::sync::Arc;

/// Build a fork holding `n` records separated by one-block holes.
fn build_fork(n: u64) -> Fork {
    let cache = BufCache::new(MemBlockDevice::new(4096, 1 << 20));
    let mut groups = AllocGroups::new_empty(AgGeometry::new(4, 1 << 18, Pool::Data).unwrap());
    let counters = Arc::new(FsCounters::new(groups.free_blocks(), 0));
    let mgr = TxnManager::new(counters);
    let mut fork = Fork::new(ForkKind::Data, false);

    for i in 0..n {
        let mut txn = mgr.begin(16).unwrap();
        {
            let mut bmap =
                Bmap::new(&mut fork, &mut txn, &cache, &mut groups, None, 1).unwrap();
            // One-block holes keep the records separate; alternating
            // states exercises both record kinds in the scan.
            let flags = WriteFlags {
                prealloc: i % 2 == 0,
                ..Default::default()
            };
            bmap.map_write(FileBlock(i * 2), 1, 0, flags, 4).unwrap();
        }
        txn.commit().unwrap();
    }
    fork
}

fn bench_map_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_read");
    for n in [16_u64, 256, 4096] {
        let fork = build_fork(n);
        group.bench_with_input(BenchmarkId::new("point_lookup", n), &n, |b, &n| {
            let mut probe = 0;
            b.iter(|| {
                probe = (probe + 7919) % (n * 2);
                map_read(&fork, FileBlock(probe), 1, 1).unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("range_scan", n), &n, |b, &n| {
            b.iter(|| map_read(&fork, FileBlock(0), n * 2, usize::MAX).unwrap());
        });
    }
    group.finish();
}

fn bench_record_codec(c: &mut Criterion) {
    let rec = ExtentRec::new_real(FileBlock(0), DiskBlock(1000), 4096, ExtState::Normal);
    c.bench_function("extent_rec_codec", |b| {
        b.iter(|| {
            let mut buf = [0_u8; 24];
            rec.encode(&mut buf).unwrap();
            ExtentRec::decode(&buf, 0).unwrap()
        });
    });
}

criterion_group!(benches, bench_map_read, bench_record_codec);
criterion_main!(benches);
