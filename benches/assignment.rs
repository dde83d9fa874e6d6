use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use authorid::{compare_names, maximum_matching};

/// Deterministic LCG score matrix.
fn matrix(n: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            (0..n)
                .map(|_| {
                    state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                    #[allow(clippy::cast_precision_loss)]
                    let v = (state >> 11) as f64 / (1u64 << 53) as f64;
                    v
                })
                .collect()
        })
        .collect()
}

fn bench_maximum_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("assignment/maximum_matching");
    // Typical records carry a handful of changed fields; large collaborations
    // can rename hundreds at once.
    for n in [4usize, 32, 128] {
        let scores = matrix(n, 42);
        group.bench_with_input(BenchmarkId::from_parameter(n), &scores, |b, scores| {
            b.iter(|| maximum_matching(black_box(scores)).unwrap());
        });
    }
    group.finish();
}

fn bench_stage_a_matrix(c: &mut Criterion) {
    let new: Vec<String> = (0..32).map(|i| format!("Author{i}, Given{}", i % 7)).collect();
    let old: Vec<String> = (0..32).map(|i| format!("Autor{i}, Given{}", i % 5)).collect();

    c.bench_function("assignment/stage_a_32x32", |b| {
        b.iter(|| {
            let scores: Vec<Vec<f64>> = new
                .iter()
                .map(|n| old.iter().map(|o| compare_names(n, o)).collect())
                .collect();
            maximum_matching(black_box(&scores)).unwrap()
        });
    });
}

criterion_group!(benches, bench_maximum_matching, bench_stage_a_matrix);
criterion_main!(benches);
