use criterion::{Criterion, criterion_group, criterion_main};
use lfsmr::lfht::Lfht;
use std::hint::black_box;
use std::sync::Arc;

fn bench_single_threaded_add(c: &mut Criterion) {
    c.bench_function("add_10k_single_thread", |b| {
        b.iter(|| {
            let table = Lfht::new(|v| v);
            for i in 0..10_000u64 {
                table.add(black_box(i), black_box(i));
            }
            table
        });
    });
}

fn bench_lookup_hit(c: &mut Criterion) {
    let table = Lfht::new(|v| v);
    for i in 0..10_000u64 {
        table.add(i, i);
    }
    c.bench_function("get_first_hit", |b| {
        b.iter(|| black_box(table.get_first(black_box(4242), |v| v == 4242)));
    });
}

fn bench_concurrent_add(c: &mut Criterion) {
    c.bench_function("add_8_threads_5k_each", |b| {
        b.iter(|| {
            let table = Arc::new(Lfht::new(|v| v));
            let handles: Vec<_> = (0..8)
                .map(|tid| {
                    let table = Arc::clone(&table);
                    std::thread::spawn(move || {
                        for i in 0u64..5_000 {
                            let v = tid * 5_000 + i;
                            table.add(v, v);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            table
        });
    });
}

criterion_group!(benches, bench_single_threaded_add, bench_lookup_hit, bench_concurrent_add);
criterion_main!(benches);
