//! GEMM throughput benchmarks
//!
//! Run: cargo bench --bench bench_gemm

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use vgpu::kernels::{matmul_blocked, matmul_naive, TileConfig};

/// Deterministic pseudo-random matrix, independent of rand versions
fn pseudo_random_matrix(n: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..n * n)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as f32 / (1u32 << 24) as f32
        })
        .collect()
}

fn bench_blocked_vs_naive(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm");
    let tiles = TileConfig::default();

    for &n in &[64usize, 128, 256] {
        let a = pseudo_random_matrix(n, 1);
        let b = pseudo_random_matrix(n, 2);
        let mut out = vec![0.0f32; n * n];

        group.throughput(Throughput::Elements((2 * n * n * n) as u64));

        group.bench_with_input(BenchmarkId::new("blocked", n), &n, |bench, &n| {
            bench.iter(|| {
                matmul_blocked(n, n, n, &a, &b, &mut out, tiles.mc, tiles.kc, tiles.nc);
            });
        });

        group.bench_with_input(BenchmarkId::new("naive", n), &n, |bench, &n| {
            bench.iter(|| {
                matmul_naive(n, n, n, &a, &b, &mut out).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_tile_sensitivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm_tiles");
    let n = 256;
    let a = pseudo_random_matrix(n, 3);
    let b = pseudo_random_matrix(n, 4);
    let mut out = vec![0.0f32; n * n];

    for &(mc, kc, nc) in &[(128, 64, 2048), (256, 128, 4096), (512, 256, 8192)] {
        let label = format!("{mc}x{kc}x{nc}");
        group.bench_function(BenchmarkId::new("tiles", label), |bench| {
            bench.iter(|| {
                matmul_blocked(n, n, n, &a, &b, &mut out, mc, kc, nc);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_blocked_vs_naive, bench_tile_sensitivity);
criterion_main!(benches);
