//! Thread creation, with and without slot reuse.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use embpthread_bench::host_runtime;
use embpthread_core::SpinPolicy;

fn bench_create_join(c: &mut Criterion) {
    let rt = host_runtime(SpinPolicy::Auto).unwrap();
    // Warm the reuse pool so every iteration recycles a slot.
    let warm = rt.create(None, || Ok(0)).unwrap();
    rt.join(warm).unwrap();
    c.bench_function("create_join_recycled", |b| {
        b.iter(|| {
            let t = rt.create(None, || Ok(black_box(1))).unwrap();
            black_box(rt.join(t).unwrap());
        });
    });
}

fn bench_self_id(c: &mut Criterion) {
    let rt = host_runtime(SpinPolicy::Auto).unwrap();
    c.bench_function("self_id", |b| b.iter(|| black_box(rt.self_id().unwrap())));
}

criterion_group!(benches, bench_create_join, bench_self_id);
criterion_main!(benches);
