use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use shared_weak::{SharedPtr, WeakPtr};
use std::time::Duration;

fn bench_make_shared_vs_from_box(c: &mut Criterion) {
    c.bench_function("shared_ptr_make_shared", |b| {
        b.iter(|| black_box(SharedPtr::make_shared(black_box([0u64; 4]))))
    });
    c.bench_function("shared_ptr_from_box", |b| {
        b.iter(|| black_box(SharedPtr::from_box(Box::new(black_box([0u64; 4])))))
    });
}

fn bench_clone_drop(c: &mut Criterion) {
    c.bench_function("shared_ptr_clone_drop", |b| {
        let p = SharedPtr::new(1u64);
        b.iter(|| {
            let x = p.clone();
            black_box(&x);
            drop(x);
        })
    });
}

fn bench_lock(c: &mut Criterion) {
    c.bench_function("weak_ptr_lock_hit", |b| {
        let p = SharedPtr::new(1u64);
        let w = p.downgrade();
        b.iter(|| black_box(w.lock()))
    });
    c.bench_function("weak_ptr_lock_expired", |b| {
        let w: WeakPtr<u64> = SharedPtr::new(1u64).downgrade();
        b.iter(|| black_box(w.lock()))
    });
}

fn bench_fan_out_teardown(c: &mut Criterion) {
    c.bench_function("shared_ptr_fan_out_1k", |b| {
        b.iter_batched(
            || SharedPtr::new(String::from("payload")),
            |p| {
                // Hold copies and observers, then release them all.
                let strongs: Vec<_> = (0..1_000).map(|_| p.clone()).collect();
                let weaks: Vec<_> = strongs.iter().map(SharedPtr::downgrade).collect();
                drop(p);
                drop(strongs);
                black_box(weaks.iter().filter(|w| w.expired()).count())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(8))
        .warm_up_time(Duration::from_secs(2))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_make_shared_vs_from_box, bench_clone_drop, bench_lock, bench_fan_out_teardown
}
criterion_main!(benches);
