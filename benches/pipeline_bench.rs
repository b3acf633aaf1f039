use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tilepipe::fixtures::{self, DescriptorPlacement, WgmmaVariant};
use tilepipe::pipeline::{pipeline_loop, run_post_expansion, PipelineState};
use tilepipe::pass::PassId;
use tilepipe::*;

// Latency of the pre-expansion pipeline on the canonical kernels.
fn bench_pipeline_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_loop");
    let kernels: [(&str, fn(u32) -> fixtures::Kernel); 4] = [
        ("matmul_direct", fixtures::matmul_direct),
        ("matmul_tma", fixtures::matmul_tma),
        ("descriptor_dot", fixtures::descriptor_dot),
        ("elementwise_stream", fixtures::elementwise_stream),
    ];
    for (name, build) in kernels {
        group.bench_function(name, |b| {
            b.iter_batched(
                || build(3),
                |mut k| {
                    let p = pipeline_loop(black_box(&mut k.module), k.for_op);
                    black_box(&p);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.bench_function("descriptor_in_if", |b| {
        b.iter_batched(
            || fixtures::descriptor_materialized(3, DescriptorPlacement::InIf { depth: 2 }),
            |mut k| {
                let p = pipeline_loop(black_box(&mut k.module), k.for_op);
                black_box(&p);
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

// Per-pass latency: each measurement runs everything up to the named pass.
fn bench_phase_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("phase_latency");
    for terminal in [
        PassId::Classify,
        PassId::Allocate,
        PassId::LowerLoads,
        PassId::Schedule,
        PassId::Finalize,
    ] {
        group.bench_function(terminal.to_string(), |b| {
            b.iter_batched(
                || fixtures::matmul_tma(3),
                |mut k| {
                    let mut state = PipelineState::for_loop(&mut k.module, k.for_op, 3);
                    let r = pipeline::run_passes(&mut state, black_box(terminal), |_, _| {});
                    black_box(&r);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

// Wait resolution scaling vs stage count.
fn bench_wait_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_waits");
    for stages in [2_u32, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}stages", stages)),
            &stages,
            |b, &stages| {
                b.iter_batched(
                    || fixtures::expanded_copy_loop(stages),
                    |mut k| {
                        let r = wait::update_waits(black_box(&mut k.module));
                        black_box(&r);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_post_expansion(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_expansion");
    for (name, variant) in [
        ("plain", WgmmaVariant::Plain),
        ("chained", WgmmaVariant::Chained),
        ("use_under_if", WgmmaVariant::UseUnderIf),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || fixtures::wgmma_loop(variant),
                |mut k| {
                    let r = run_post_expansion(black_box(&mut k.module));
                    black_box(&r);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_pipeline_loop,
    bench_phase_latency,
    bench_wait_scaling,
    bench_post_expansion
);
criterion_main!(benches);
