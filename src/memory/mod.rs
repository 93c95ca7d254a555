//! Tiered memory subsystem
//!
//! Implements the three-level memory hierarchy underneath the runtime:
//!
//! - **Tiered allocator**: handle-indirected allocations with per-tier
//!   accounting, pressure-driven eviction, hot-data promotion and pinning
//! - **Backing-store pools**: mapped-file address spaces for the two
//!   slower tiers (in-memory filesystem and on-disk)
//! - **Spill executor**: fixed worker pool draining a priority queue of
//!   inter-tier copy jobs, with synchronous fallback under back-pressure
//!
//! # Architecture
//!
//! ```text
//! caller ── allocate/get/pin ──> TieredAllocator ──┬── Fast:   process heap
//!                                   │              ├── Medium: MappedPool (tmpfs)
//!                                   │              └── Slow:   MappedPool (disk)
//!                                   └── demote/promote jobs ──> SpillExecutor
//! ```
//!
//! Handles stay valid across migration; [`TieredAllocator::get`] is the only
//! authoritative way to obtain an allocation's current address.

pub mod allocator;
pub mod pool;
mod record;
pub mod region;
pub mod spill;
pub mod tier;

// Re-exports for convenient access
pub use allocator::{AllocatorConfig, AllocatorStats, TierUsage, TieredAllocator};
pub use pool::{MappedPool, PoolConfig, DEFAULT_VRAM_CAPACITY, DEFAULT_VRAM_DIR, DEFAULT_VSSD_DIR};
pub use region::{AllocHandle, Region};
pub use spill::{
    SpillConfig, SpillExecutor, SpillJob, SpillKind, SpillStats, EVICT_PRIORITY, PROMOTE_PRIORITY,
};
pub use tier::MemoryTier;
