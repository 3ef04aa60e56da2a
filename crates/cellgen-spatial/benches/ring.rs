//! Search ring construction and area lock throughput.

use std::hint::black_box;

use cellgen_spatial::{AreaLock, CellPos, WriteRadius, search_ring};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn ring_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_ring");

    for radius in [4, 12, 33] {
        group.bench_with_input(BenchmarkId::new("cached", radius), &radius, |b, &radius| {
            b.iter(|| black_box(search_ring(radius).map(<[CellPos]>::len)));
        });
    }

    group.finish();
}

fn area_lock_benchmarks(c: &mut Criterion) {
    let lock = AreaLock::new(0);

    c.bench_function("area_lock/try_lock_detached_r2", |b| {
        let mut x = 0;
        b.iter(|| {
            x += 7;
            black_box(lock.try_lock_detached(CellPos::new(x, 0), WriteRadius::Bounded(2)))
        });
    });
}

criterion_group!(benches, ring_benchmarks, area_lock_benchmarks);
criterion_main!(benches);
