use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use psz_sync::{PserializeDomain, PsrefClass, VariantRoot};

// Benchmark 1: Single-threaded read section enter/exit
fn bench_read_enter_exit(c: &mut Criterion) {
    c.bench_function("pserialize_read_enter_exit", |b| {
        let domain = PserializeDomain::new();
        let participant = domain.register_participant();

        b.iter(|| {
            let _section = participant.read_enter();
            black_box(());
        });
    });

    c.bench_function("crossbeam_epoch_pin_unpin", |b| {
        b.iter(|| {
            let _guard = crossbeam_epoch::pin();
            black_box(());
        });
    });
}

// Benchmark 2: Pinning the current variant (section + psref acquire/release)
fn bench_variant_get(c: &mut Criterion) {
    c.bench_function("variant_get_put", |b| {
        let domain = PserializeDomain::new();
        let class = PsrefClass::new("bench");
        let root = VariantRoot::new(&domain, &class, 42u64);
        let participant = domain.register_participant();

        b.iter(|| {
            let value = root.get(&participant);
            black_box(value.map(|v| *v));
        });
    });

    c.bench_function("crossbeam_epoch_load", |b| {
        let atomic = crossbeam_epoch::Atomic::new(42u64);

        b.iter(|| {
            let guard = crossbeam_epoch::pin();
            let shared = atomic.load(Ordering::Acquire, &guard);
            // SAFETY: never freed while the benchmark runs.
            black_box(unsafe { shared.deref() });
        });
    });
}

// Benchmark 3: Concurrent readers against a writer that keeps replacing
fn bench_readers_with_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("readers_with_writer");
    group.sample_size(10);

    for num_readers in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("variant_root", num_readers),
            num_readers,
            |b, &num_readers| {
                b.iter(|| {
                    let domain = PserializeDomain::new();
                    let class = PsrefClass::new("bench");
                    let root = Arc::new(VariantRoot::new(&domain, &class, 0u64));

                    let handles: Vec<_> = (0..num_readers)
                        .map(|_| {
                            let d = domain.clone();
                            let r = root.clone();
                            thread::spawn(move || {
                                let participant = d.register_participant();
                                for _ in 0..500 {
                                    let value = r.get(&participant);
                                    black_box(value.map(|v| *v));
                                }
                            })
                        })
                        .collect();

                    for i in 1..=10u64 {
                        black_box(root.replace(i));
                    }

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

// Benchmark 4: Grace period cost with idle participants
fn bench_synchronize(c: &mut Criterion) {
    let mut group = c.benchmark_group("synchronize");

    for num_participants in [1, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::new("idle_participants", num_participants),
            num_participants,
            |b, &num_participants| {
                let domain = PserializeDomain::new();
                let _participants: Vec<_> = (0..num_participants)
                    .map(|_| domain.register_participant())
                    .collect();

                b.iter(|| domain.synchronize());
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_read_enter_exit,
    bench_variant_get,
    bench_readers_with_writer,
    bench_synchronize
);
criterion_main!(benches);
