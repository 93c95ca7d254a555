//! # vgpu
//!
//! CPU-resident "virtual GPU" runtime: a compute-and-memory substrate for
//! workloads written against a discrete accelerator but running on a host
//! without one.
//!
//! ## Features
//!
//! - **Tiered memory**: three-level hierarchy (heap / tmpfs-mapped /
//!   disk-mapped) behind stable handles, with LRU eviction under pressure,
//!   hot-data promotion, pinning and asynchronous spill
//! - **Cache-blocked GEMM**: hierarchically tiled single-precision matrix
//!   multiply with an AVX2/FMA micro-kernel and scalar fallback
//! - **Autotuning**: tile sizes chosen by online microbenchmarks over the
//!   detected cache hierarchy, persisted across process restarts
//! - **Work stealing**: priority-hinted task pool with NUMA-aware worker
//!   placement
//!
//! ## Example
//!
//! ```no_run
//! use vgpu::memory::{MemoryTier, TieredAllocator};
//!
//! let allocator = TieredAllocator::with_defaults()?;
//! let handle = allocator.allocate(1 << 20, MemoryTier::Fast)?;
//!
//! // The handle survives migrations; always re-fetch the address.
//! let ptr = allocator.get(handle).unwrap();
//! # let _ = ptr;
//! allocator.deallocate(handle);
//! # Ok::<(), vgpu::VgpuError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod kernels;
pub mod memory;
pub mod runtime;
pub mod topology;

// Re-exports
pub use error::{Result, VgpuError};
pub use kernels::{matmul, matmul_blocked, Autotuner, TileConfig};
pub use memory::{AllocHandle, AllocatorConfig, MemoryTier, TieredAllocator};
pub use runtime::WorkStealingPool;
pub use topology::{cache_sizes, numa_topology, CacheTopology};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Result, VgpuError};
    pub use crate::kernels::{matmul, matmul_blocked, Autotuner, TileConfig};
    pub use crate::memory::{
        AllocHandle, AllocatorConfig, AllocatorStats, MemoryTier, SpillConfig, SpillExecutor,
        SpillJob, SpillKind, TieredAllocator,
    };
    pub use crate::runtime::{TaskPriority, WorkStealingPool};
    pub use crate::topology::{cache_sizes, numa_topology, CacheTopology};
}
