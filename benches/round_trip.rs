use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use semshm::{KeyAllocator, SemaphoredReader, SemaphoredWriter};
use std::sync::Arc;

fn round_trip(c: &mut Criterion) {
    let keys = Arc::new(KeyAllocator::per_process());
    let mut group = c.benchmark_group("round_trip");

    for size in [64usize, 4096, 64 * 1024] {
        let writer = SemaphoredWriter::new(keys.clone());
        let reader = SemaphoredReader::new();
        let payload = vec![0xA5u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let handle = writer.write_bytes(black_box(payload)).unwrap();
                black_box(reader.read_bytes(&handle).unwrap())
            })
        });
    }

    group.finish();
}

fn growth(c: &mut Criterion) {
    let keys = Arc::new(KeyAllocator::per_process());

    c.bench_function("write_with_reallocation", |b| {
        b.iter_batched(
            || SemaphoredWriter::new(keys.clone()),
            |writer| {
                for len in [16usize, 256, 4096] {
                    black_box(writer.write_bytes(&vec![1u8; len]).unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, round_trip, growth);
criterion_main!(benches);
