//! Shard-assignment throughput.
//!
//! The collect pass hashes every listed path once; this keeps an eye on the
//! cost per path for realistic key lengths.

use criterion::{Criterion, criterion_group, criterion_main};
use s3gc::partition::{crc32, shard};
use std::hint::black_box;

fn bench_crc32(c: &mut Criterion) {
    let short = "data/abc/part-0001.bin";
    let long = format!("data/{}/{}", "d".repeat(64), "part-0000000001.bin");

    let mut group = c.benchmark_group("crc32");
    group.bench_function("short_path", |b| {
        b.iter(|| crc32(black_box(short.as_bytes())));
    });
    group.bench_function("long_path", |b| {
        b.iter(|| crc32(black_box(long.as_bytes())));
    });
    group.finish();
}

fn bench_shard(c: &mut Criterion) {
    let paths: Vec<String> = (0..1024)
        .map(|i| format!("data/xyz/{i:08}/part.bin"))
        .collect();

    c.bench_function("shard_1024_paths", |b| {
        b.iter(|| {
            for path in &paths {
                black_box(shard(black_box(path), 16));
            }
        });
    });
}

criterion_group!(benches, bench_crc32, bench_shard);
criterion_main!(benches);
