//! Benchmarks for exact top-k gallery search.
//!
//! Uses a synthetic 10,000 x 768 gallery by default. Set `BENCH_FULL_SCALE=1`
//! for 100,000 rows:
//!
//! ```bash
//! BENCH_FULL_SCALE=1 cargo bench -p glance-gallery
//! ```

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;

use glance_core::config::GalleryConfig;
use glance_gallery::{GalleryIndex, GallerySearcher};

const DIM: usize = 768;
const CI_ROWS: usize = 10_000;
const FULL_SCALE_ROWS: usize = 100_000;

fn row_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_ROWS
    } else {
        CI_ROWS
    }
}

/// Deterministic pseudo-random gallery; rows are normalized on construction.
fn build_searcher(rows: usize) -> GallerySearcher {
    let features = Array2::from_shape_fn((rows, DIM), |(i, j)| {
        let x = (i as u64).wrapping_mul(6_364_136_223_846_793_005)
            ^ (j as u64).wrapping_mul(1_442_695_040_888_963_407);
        ((x >> 33) as f32 / (1u64 << 31) as f32) - 0.5
    });
    let index = GalleryIndex::from_parts(Some(features), Vec::new());
    GallerySearcher::new(Arc::new(index), &GalleryConfig::default())
}

fn query() -> Vec<f32> {
    let mut q: Vec<f32> = (0..DIM).map(|j| ((j as f32) * 0.37).sin()).collect();
    let norm = q.iter().map(|v| v * v).sum::<f32>().sqrt();
    q.iter_mut().for_each(|v| *v /= norm);
    q
}

fn bench_top_k(c: &mut Criterion) {
    let rows = row_count();
    let searcher = build_searcher(rows);
    let q = query();

    let mut group = c.benchmark_group("gallery_search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    for k in [10usize, 50, 200] {
        group.bench_with_input(BenchmarkId::new(format!("top_k_{}rows", rows), k), &k, |b, &k| {
            b.iter(|| {
                let hits = searcher.search(black_box(&q), k);
                assert_eq!(hits.len(), k);
                hits
            });
        });
    }

    group.bench_function(format!("full_sort_{}rows", rows), |b| {
        b.iter(|| searcher.search(black_box(&q), rows));
    });

    group.finish();
}

criterion_group!(benches, bench_top_k);
criterion_main!(benches);
