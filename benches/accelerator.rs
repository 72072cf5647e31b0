//! Criterion benchmarks for dense vs. selective inference.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use synapse_cache::accelerator::{Accelerator, AcceleratorConfig};
use synapse_cache::graph::{GraphConfig, NodeId};
use synapse_cache::pathway::{MemoryConfig, PathwayMemory};
use synapse_cache::prng::Prng;

fn one_hot(n: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; n];
    v[i] = 1.0;
    v
}

fn trained(hidden: usize, top_k: usize) -> Accelerator {
    let mut acc = Accelerator::from_configs(
        GraphConfig::with_size(32, hidden, 10).with_seed(42),
        MemoryConfig::default().with_exploration(0.0, 0.0),
        AcceleratorConfig::default().with_top_k(top_k),
    )
    .unwrap();
    for epoch in 0..5 {
        for i in 0..5 {
            acc.train_step(&one_hot(32, i), (i + epoch) % 10, 0.1, "bench")
                .unwrap();
        }
    }
    acc
}

/// Dense pass vs. fast inference at growing hidden sizes.
fn bench_inference_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("inference");

    for hidden in [64, 256, 1024].iter() {
        group.throughput(Throughput::Elements(*hidden as u64));
        let x = one_hot(32, 1);

        group.bench_with_input(BenchmarkId::new("dense", hidden), hidden, |b, &hidden| {
            let mut acc = trained(hidden, 20);
            b.iter(|| black_box(acc.graph_mut().forward(&x).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("selective", hidden), hidden, |b, &hidden| {
            let mut acc = trained(hidden, 20);
            b.iter(|| black_box(acc.fast_inference(&x).unwrap()));
        });
    }

    group.finish();
}

/// Top-K ranking cost as K grows.
fn bench_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("ranking");
    let mut acc = trained(256, 20);

    for top_k in [10, 50, 200].iter() {
        acc.configure(*top_k, 0.0).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(top_k), top_k, |b, _| {
            b.iter(|| black_box(acc.ranked_pathways().len()));
        });
    }

    group.finish();
}

/// Recording throughput including periodic forgetting sweeps.
fn bench_record_access(c: &mut Criterion) {
    c.bench_function("record_access", |b| {
        let mut mem = PathwayMemory::new(MemoryConfig::default(), Prng::new(7)).unwrap();
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(1);
            mem.record_access(NodeId(i % 97), NodeId(100 + i % 31), 0.5, "bench");
            black_box(mem.sequence())
        });
    });
}

/// Image save/load round-trip.
fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");
    let acc = trained(64, 20);

    group.bench_function("save", |b| {
        let mut buf = Vec::with_capacity(256 * 1024);
        b.iter(|| {
            buf.clear();
            acc.save_image_to(&mut buf).unwrap();
            black_box(buf.len())
        });
    });

    group.bench_function("load", |b| {
        let mut buf = Vec::new();
        acc.save_image_to(&mut buf).unwrap();
        b.iter(|| {
            let mut cursor = std::io::Cursor::new(&buf);
            let loaded = Accelerator::load_image_from(&mut cursor).unwrap();
            black_box(loaded.stats().pathway_count)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_inference_modes,
    bench_ranking,
    bench_record_access,
    bench_serialization
);
criterion_main!(benches);
