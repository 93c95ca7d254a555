//! GEMM micro-kernels
//!
//! Both kernels compute `C[0:ib, 0:jb] += A[0:ib, 0:pb] * B[0:pb, 0:jb]` on
//! row-major single-precision blocks with explicit row strides. The
//! vectorised kernel needs AVX2 and FMA; availability is probed once per
//! process and the blocked driver falls back to the scalar kernel when the
//! probe fails or a block dimension is below the SIMD width.

use std::sync::OnceLock;

/// SIMD width of the vectorised kernel: 8 single-precision lanes
pub const SIMD_WIDTH: usize = 8;

static SIMD_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Whether the vectorised kernel is usable on this CPU, probed once
pub fn simd_available() -> bool {
    *SIMD_AVAILABLE.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    })
}

/// Scalar block kernel
///
/// The `i, k, j` loop order keeps the inner writes to `C` and reads from `B`
/// streaming contiguously in `j`.
///
/// # Safety
///
/// `a`, `b` and `c` must be valid for the strided accesses
/// `a[i * lda + k]`, `b[k * ldb + j]`, `c[i * ldc + j]` over
/// `i < ib, k < pb, j < jb`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn block_scalar(
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
    for i in 0..ib {
        for k in 0..pb {
            let a_ik = *a.add(i * lda + k);
            for j in 0..jb {
                *c.add(i * ldc + j) += a_ik * *b.add(k * ldb + j);
            }
        }
    }
}

/// AVX2/FMA block kernel
///
/// For each row, full 8-lane column chunks accumulate in a vector register:
/// broadcast `A[i, k]`, load an 8-wide slab of `B[k, :]`, fused
/// multiply-add. The `jb % 8` column remainder takes the scalar path.
///
/// # Safety
///
/// Same access contract as [`block_scalar`]; additionally the caller must
/// have verified AVX2 and FMA support (see [`simd_available`]).
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
#[allow(clippy::too_many_arguments)]
pub unsafe fn block_avx2(
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
    use std::arch::x86_64::*;

    let j_vec = jb - jb % SIMD_WIDTH;

    for i in 0..ib {
        let mut j = 0;
        while j < j_vec {
            let mut acc = _mm256_loadu_ps(c.add(i * ldc + j));
            for k in 0..pb {
                let va = _mm256_broadcast_ss(&*a.add(i * lda + k));
                let vb = _mm256_loadu_ps(b.add(k * ldb + j));
                acc = _mm256_fmadd_ps(va, vb, acc);
            }
            _mm256_storeu_ps(c.add(i * ldc + j), acc);
            j += SIMD_WIDTH;
        }

        // Column remainder
        for jj in j..jb {
            let mut sum = *c.add(i * ldc + jj);
            for k in 0..pb {
                sum += *a.add(i * lda + k) * *b.add(k * ldb + jj);
            }
            *c.add(i * ldc + jj) = sum;
        }
    }
}
