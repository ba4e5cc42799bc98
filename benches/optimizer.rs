//! Benchmarks for the parameter search
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipeline_autotune::config::{AutotuneAlgorithm, OptimizerSettings};
use pipeline_autotune::host::Budgets;
use pipeline_autotune::model::{
    compute_wait_time, Model, NodeBuilder, NodeKind, Optimizer, Parameter, BUFFER_SIZE,
    PARALLELISM,
};

const MS: u64 = 1_000_000;

/// Model of `stages` map+prefetch pairs stacked on a source
fn stacked_model(stages: usize) -> Model {
    let model = Model::default();
    let mut parent = model
        .add_node(None, NodeBuilder::new("Model", NodeKind::KnownRatio(1.0)))
        .unwrap();
    for stage in 0..stages {
        let prefetch = model
            .add_node(
                Some(&parent),
                NodeBuilder::new("Prefetch", NodeKind::Async(1.0))
                    .parameter(Parameter::new(BUFFER_SIZE, 0, 0, 64).unwrap().shared()),
            )
            .unwrap();
        let map = model
            .add_node(
                Some(&prefetch),
                NodeBuilder::new("ParallelMap", NodeKind::Async(1.0))
                    .parameter(Parameter::new(PARALLELISM, 1, 1, 16).unwrap().shared()),
            )
            .unwrap();
        for node in [&prefetch, &map] {
            for _ in 0..100 {
                node.record_element();
            }
            node.record_bytes_produced(100 * 256);
        }
        map.add_processing_time(100 * (stage as u64 + 1) * MS);
        parent = map;
    }
    let source = model
        .add_node(Some(&parent), NodeBuilder::new("Range", NodeKind::Source))
        .unwrap();
    for _ in 0..100 {
        source.record_element();
    }
    source.add_processing_time(100 * MS / 10);
    model
}

fn bench_optimizer_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer_step");
    let budgets = Budgets::new(16, 1 << 20);

    for stages in [1usize, 4, 16] {
        let snapshot = stacked_model(stages).snapshot();
        for algorithm in AutotuneAlgorithm::ALL {
            let optimizer = Optimizer::new(algorithm, &OptimizerSettings::default());
            group.bench_with_input(
                BenchmarkId::new(algorithm.as_str(), stages),
                &snapshot,
                |b, snapshot| b.iter(|| optimizer.step(black_box(snapshot), &budgets, 0.0)),
            );
        }
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let model = stacked_model(16);
    c.bench_function("snapshot_16_stages", |b| b.iter(|| black_box(model.snapshot())));
}

fn bench_output_time(c: &mut Criterion) {
    let snapshot = stacked_model(16).snapshot();
    let values = snapshot.current_values();
    c.bench_function("output_time_16_stages", |b| {
        b.iter(|| snapshot.output_time(black_box(&values), 0.0))
    });
    c.bench_function("output_time_with_gradients_16_stages", |b| {
        b.iter(|| snapshot.output_time_with_gradients(black_box(&values), 0.0))
    });
}

fn bench_wait_time(c: &mut Criterion) {
    c.bench_function("compute_wait_time", |b| {
        b.iter(|| compute_wait_time(black_box(2.0e6), black_box(1.5e6), black_box(8.0)))
    });
}

criterion_group!(
    benches,
    bench_optimizer_step,
    bench_snapshot,
    bench_output_time,
    bench_wait_time
);
criterion_main!(benches);
