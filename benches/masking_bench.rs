//! Performance benchmarks for the masking engine.
//!
//! One global mask per global view and iteration sits on the critical path
//! between the teacher and the student forwards.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use destilar::masking::{cls_attention, frame_mean, local_masks, AttentionGuidedMasker, MaskingConfig};
use ndarray::{Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_attention(rows: usize, heads: usize, tokens: usize, rng: &mut StdRng) -> Array4<f32> {
    Array4::from_shape_fn((rows, heads, tokens + 1, tokens + 1), |_| rng.gen::<f32>())
}

/// Benchmark AttentionGuidedMasker::compute_global_mask over grid sizes
fn bench_global_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("GlobalMask");
    let masker = AttentionGuidedMasker::new(MaskingConfig::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(0);

    for grid in [7usize, 14, 28].iter() {
        let tokens = grid * grid;
        let batch = 32;
        let scores = Array2::from_shape_fn((batch, tokens), |_| rng.gen::<f32>());
        group.throughput(Throughput::Elements((batch * tokens) as u64));
        group.bench_with_input(BenchmarkId::new("compute", tokens), grid, |b, &grid| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter(|| {
                black_box(
                    masker
                        .compute_global_mask(&scores, 8, (grid, grid), &mut rng)
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

/// Benchmark class-token extraction from ViT-S/16 sized attention maps
fn bench_cls_attention(c: &mut Criterion) {
    let mut group = c.benchmark_group("ClsAttention");
    let mut rng = StdRng::seed_from_u64(2);
    let (batch, frames) = (4, 8);
    let attention = random_attention(batch * frames, 6, 196, &mut rng);

    group.bench_function("cls_then_frame_mean", |b| {
        b.iter(|| {
            let cls = cls_attention(&attention, batch).unwrap();
            black_box(frame_mean(&cls).unwrap())
        });
    });
    group.finish();
}

/// Benchmark tube-mask reshaping for the local views
fn bench_local_masks(c: &mut Criterion) {
    let mut group = c.benchmark_group("LocalMasks");
    let mut rng = StdRng::seed_from_u64(3);
    let raw: Vec<Array3<bool>> = (0..8)
        .map(|_| Array3::from_shape_fn((32, 8, 36), |_| rng.gen_bool(0.9)))
        .collect();

    group.bench_function("eight_views", |b| {
        b.iter(|| black_box(local_masks(&raw, (6, 6)).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_global_mask, bench_cls_attention, bench_local_masks);
criterion_main!(benches);
