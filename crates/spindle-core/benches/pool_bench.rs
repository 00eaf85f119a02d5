// Criterion benchmarks for spindle-core
//
// Run benchmarks with:
//   cargo bench -p spindle-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use spindle_core::{AddressablePq, LeastConnections, RoundRobin};

fn bench_pqueue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("pqueue_push_pop");

    for size in [16, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut pq: AddressablePq<String, u64, _> = AddressablePq::new();
                for value in 0..size {
                    pq.push(value.to_string(), black_box(value));
                }
                while pq.pop().is_some() {}
            });
        });
    }

    group.finish();
}

fn bench_pqueue_emplace(c: &mut Criterion) {
    let mut group = c.benchmark_group("pqueue_emplace");

    group.bench_function("reweigh_1024", |b| {
        let mut pq: AddressablePq<String, u64, _> = AddressablePq::new();
        for value in 0..1024u64 {
            pq.push(value.to_string(), value);
        }
        let mut next = 0u64;
        b.iter(|| {
            let key = (next % 1024).to_string();
            pq.emplace(black_box(&key), black_box(next));
            next = next.wrapping_add(7);
        });
    });

    group.finish();
}

fn bench_round_robin_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_register");

    for count in [2, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let urls: Vec<String> = (0..count)
                .map(|i| format!("http://localhost:{}", 9000 + i))
                .collect();
            b.iter(|| RoundRobin::new(black_box(&urls)).unwrap());
        });
    }

    group.finish();
}

fn bench_least_connections_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("least_connections_select");

    for count in [2, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let urls: Vec<String> = (0..count)
                .map(|i| format!("http://localhost:{}", 9000 + i))
                .collect();
            let lc = LeastConnections::new(&urls).unwrap();
            for backend in lc.backends() {
                backend.set_alive(true);
            }
            b.iter(|| {
                let selected = lc.select().unwrap();
                black_box(selected.backend().url());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pqueue_push_pop,
    bench_pqueue_emplace,
    bench_round_robin_register,
    bench_least_connections_next
);
criterion_main!(benches);
