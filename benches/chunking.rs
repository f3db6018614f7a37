//! Benchmark: chunk planning, hyperslab copies and the chunk filter pipeline
//!
//!   cargo bench --bench chunking

use criterion::{criterion_group, criterion_main, Criterion};
use dcollect::compression::{CompressionMethod, FilterPipeline};
use dcollect::dims::{copy_hyperslab, Hyperslab};
use dcollect::layout::plan_chunks;
use std::hint::black_box;

fn field_bytes(elements: usize) -> Vec<u8> {
    (0..elements)
        .flat_map(|i| ((i as f32 * 0.01).sin()).to_le_bytes())
        .collect()
}

fn bench_plan(c: &mut Criterion) {
    c.bench_function("plan_chunks 3d", |b| {
        b.iter(|| plan_chunks(black_box(&[512, 512, 256]), 4))
    });
    c.bench_function("plan_chunks 1d", |b| {
        b.iter(|| plan_chunks(black_box(&[1 << 30]), 8))
    });
}

fn bench_hyperslab(c: &mut Criterion) {
    let shape = vec![64u64, 128, 128];
    let src = field_bytes(64 * 128 * 128);
    let mut dst = vec![0u8; src.len()];

    let dense = Hyperslab::dense(vec![0, 0, 0], shape.clone());
    c.bench_function("copy_hyperslab dense", |b| {
        b.iter(|| copy_hyperslab(black_box(&src), &shape, &dense, &mut dst, &shape, &dense, 4).unwrap())
    });

    let strided = Hyperslab::new(vec![0, 0, 0], vec![2, 2, 2], vec![32, 64, 64]);
    let packed_shape = vec![32u64, 64, 64];
    let packed = Hyperslab::dense(vec![0, 0, 0], packed_shape.clone());
    let mut out = vec![0u8; 32 * 64 * 64 * 4];
    c.bench_function("copy_hyperslab strided", |b| {
        b.iter(|| {
            copy_hyperslab(black_box(&src), &shape, &strided, &mut out, &packed_shape, &packed, 4).unwrap()
        })
    });
}

fn bench_filters(c: &mut Criterion) {
    let raw = field_bytes(256 * 1024);
    for method in [CompressionMethod::Deflate, CompressionMethod::Zstd] {
        let pipeline = FilterPipeline::with_method(method);
        let stored = pipeline.encode(&raw, 4).unwrap();
        c.bench_function(&format!("encode {:?}", method), |b| {
            b.iter(|| pipeline.encode(black_box(&raw), 4).unwrap())
        });
        c.bench_function(&format!("decode {:?}", method), |b| {
            b.iter(|| pipeline.decode(black_box(&stored), 4, raw.len()).unwrap())
        });
    }
}

criterion_group!(benches, bench_plan, bench_hyperslab, bench_filters);
criterion_main!(benches);
