//! Blocked GEMM driver and reference kernels
//!
//! The blocked driver streams cache-sized tiles through the micro-kernels
//! using the panel ordering that keeps the current `A`-panel hot in L2, the
//! current `B`-slice hot in L3 and the accumulator hot in registers:
//! `j` over N-panels outermost, then `p` over K-panels, then `i` over
//! M-panels. The naive kernels stay as correctness references and as the
//! fallback entry for small problems.

use crate::error::{Result, VgpuError};

use super::microkernel::{block_scalar, simd_available, SIMD_WIDTH};
use super::tuner::Autotuner;

/// Cache-blocked matrix multiply: `C = A * B`
///
/// `A` is `m x k`, `B` is `k x n`, `C` is `m x n`, all row-major and
/// contiguous. `(mc, kc, nc)` are the tile sizes on the M, K and N axes;
/// dimensions smaller than a tile degenerate to a single iteration at the
/// residual size. Zero-sized inputs return immediately with no writes.
#[allow(clippy::too_many_arguments)]
pub fn matmul_blocked(
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    mc: usize,
    kc: usize,
    nc: usize,
) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    assert!(mc > 0 && kc > 0 && nc > 0, "tile sizes must be positive");
    debug_assert!(a.len() >= m * k);
    debug_assert!(b.len() >= k * n);
    debug_assert!(c.len() >= m * n);

    c[..m * n].fill(0.0);

    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();
    let c_ptr = c.as_mut_ptr();

    for j in (0..n).step_by(nc) {
        let jb = nc.min(n - j);
        for p in (0..k).step_by(kc) {
            let pb = kc.min(k - p);
            for i in (0..m).step_by(mc) {
                let ib = mc.min(m - i);
                // Safety: the loop bounds and the length assertions above
                // keep every strided access inside the three slices.
                unsafe {
                    dispatch_block(
                        ib,
                        jb,
                        pb,
                        a_ptr.add(i * k + p),
                        b_ptr.add(p * n + j),
                        c_ptr.add(i * n + j),
                        k,
                        n,
                        n,
                    );
                }
            }
        }
    }
}

/// Route one block to the vectorised kernel when every block dimension
/// reaches the SIMD width, scalar otherwise
#[allow(clippy::too_many_arguments)]
unsafe fn dispatch_block(
    ib: usize,
    jb: usize,
    pb: usize,
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    lda: usize,
    ldb: usize,
    ldc: usize,
) {
    #[cfg(target_arch = "x86_64")]
    {
        if simd_available() && ib >= SIMD_WIDTH && jb >= SIMD_WIDTH && pb >= SIMD_WIDTH {
            super::microkernel::block_avx2(ib, jb, pb, a, b, c, lda, ldb, ldc);
            return;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = (simd_available(), SIMD_WIDTH);

    block_scalar(ib, jb, pb, a, b, c, lda, ldb, ldc);
}

/// Naive triple-loop reference: `C = A * B`, contiguous row-major
///
/// # Errors
///
/// `InvalidArgument` when a slice is shorter than its shape requires.
pub fn matmul_naive(m: usize, n: usize, k: usize, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
    if a.len() < m * k || b.len() < k * n || c.len() < m * n {
        return Err(VgpuError::InvalidArgument(format!(
            "matrix buffers too small for {m}x{k} * {k}x{n}"
        )));
    }

    c[..m * n].fill(0.0);
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = sum;
        }
    }
    Ok(())
}

/// Naive reference with explicit row strides
///
/// # Errors
///
/// `InvalidArgument` when a stride is smaller than the row extent it has to
/// cover, or a slice is too short for its strided extent.
#[allow(clippy::too_many_arguments)]
pub fn matmul_naive_strided(
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) -> Result<()> {
    if lda < k || ldb < n || ldc < n {
        return Err(VgpuError::InvalidArgument(format!(
            "stride smaller than row extent: lda={lda} (k={k}), ldb={ldb} (n={n}), ldc={ldc}"
        )));
    }
    if m == 0 || n == 0 || k == 0 {
        return Ok(());
    }
    if a.len() < (m - 1) * lda + k || b.len() < (k - 1) * ldb + n || c.len() < (m - 1) * ldc + n {
        return Err(VgpuError::InvalidArgument(
            "matrix buffers too small for strided extents".to_string(),
        ));
    }

    for i in 0..m {
        c[i * ldc..i * ldc + n].fill(0.0);
    }
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * lda + p] * b[p * ldb + j];
            }
            c[i * ldc + j] = sum;
        }
    }
    Ok(())
}

/// Dense contiguous multiply using the autotuned tile triple
///
/// `a` is `m x k`, `b` is `k x n`; returns the `m x n` product.
///
/// # Errors
///
/// `InvalidArgument` on shape mismatch.
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
    if a.len() != m * k {
        return Err(VgpuError::InvalidArgument(format!(
            "lhs has {} elements, expected {m}x{k} = {}",
            a.len(),
            m * k
        )));
    }
    if b.len() != k * n {
        return Err(VgpuError::InvalidArgument(format!(
            "rhs has {} elements, expected {k}x{n} = {}",
            b.len(),
            k * n
        )));
    }

    let mut c = vec![0.0f32; m * n];
    let tiles = Autotuner::global().config();
    matmul_blocked(m, n, k, a, b, &mut c, tiles.mc, tiles.kc, tiles.nc);
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(x: &[f32], y: &[f32]) -> f32 {
        x.iter()
            .zip(y.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_identity_times_matrix() {
        // A = I4, B is 4x2: C must equal B.
        let mut a = vec![0.0f32; 16];
        for i in 0..4 {
            a[i * 4 + i] = 1.0;
        }
        let b = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let mut c = vec![0.0f32; 8];

        matmul_blocked(4, 2, 4, &a, &b, &mut c, 256, 128, 4096);
        assert_eq!(c, b);
    }

    #[test]
    fn test_blocked_matches_naive_small() {
        let (m, n, k) = (17, 23, 11);
        let a: Vec<f32> = (0..m * k).map(|v| ((v * 7919) % 100) as f32 * 0.01).collect();
        let b: Vec<f32> = (0..k * n).map(|v| ((v * 104729) % 100) as f32 * 0.01).collect();

        let mut c_blocked = vec![0.0f32; m * n];
        let mut c_naive = vec![0.0f32; m * n];

        matmul_blocked(m, n, k, &a, &b, &mut c_blocked, 8, 8, 8);
        matmul_naive(m, n, k, &a, &b, &mut c_naive).unwrap();

        assert!(max_abs_diff(&c_blocked, &c_naive) < 1e-4);
    }

    #[test]
    fn test_tiles_larger_than_problem() {
        let (m, n, k) = (3, 3, 3);
        let a: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let b: Vec<f32> = (1..=9).map(|v| v as f32).collect();

        let mut c_blocked = vec![0.0f32; 9];
        let mut c_naive = vec![0.0f32; 9];

        matmul_blocked(m, n, k, &a, &b, &mut c_blocked, 512, 256, 8192);
        matmul_naive(m, n, k, &a, &b, &mut c_naive).unwrap();
        assert_eq!(c_blocked, c_naive);
    }

    #[test]
    fn test_zero_dimension_no_writes() {
        let a = vec![1.0f32; 4];
        let b = vec![1.0f32; 4];
        let mut c = vec![9.0f32; 4];
        matmul_blocked(0, 2, 2, &a, &b, &mut c, 8, 8, 8);
        matmul_blocked(2, 2, 0, &a, &b, &mut c, 8, 8, 8);
        assert_eq!(c, vec![9.0f32; 4]);
    }

    #[test]
    fn test_strided_matches_contiguous() {
        let (m, n, k) = (6, 5, 4);
        let a: Vec<f32> = (0..m * k).map(|v| v as f32 * 0.5).collect();
        let b: Vec<f32> = (0..k * n).map(|v| v as f32 * 0.25).collect();

        let mut c_contig = vec![0.0f32; m * n];
        let mut c_strided = vec![0.0f32; m * n];

        matmul_naive(m, n, k, &a, &b, &mut c_contig).unwrap();
        matmul_naive_strided(m, n, k, &a, k, &b, n, &mut c_strided, n).unwrap();
        assert_eq!(c_contig, c_strided);
    }

    #[test]
    fn test_strided_rejects_short_stride() {
        let a = vec![0.0f32; 16];
        let b = vec![0.0f32; 16];
        let mut c = vec![0.0f32; 16];
        let err = matmul_naive_strided(4, 4, 4, &a, 3, &b, 4, &mut c, 4).unwrap_err();
        assert!(matches!(err, VgpuError::InvalidArgument(_)));
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = vec![0.0f32; 6];
        let b = vec![0.0f32; 5];
        assert!(matmul(&a, &b, 2, 3, 2).is_err());
    }
}
