//! Numerical kernels
//!
//! Single-precision matrix multiply in three layers: micro-kernels that
//! process one cache-resident block, a blocked driver that tiles the full
//! problem through them, and an autotuner that picks the tile sizes for the
//! machine it runs on.

pub mod gemm;
pub mod microkernel;
pub mod tuner;

// Re-exports for convenient access
pub use gemm::{matmul, matmul_blocked, matmul_naive, matmul_naive_strided};
pub use microkernel::{simd_available, SIMD_WIDTH};
pub use tuner::{Autotuner, TileConfig, DEFAULT_PROBE_SIZE};
