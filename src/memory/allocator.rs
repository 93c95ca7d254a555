//! Tiered memory allocator
//!
//! The definitive handle table and placement policy for the three-tier
//! hierarchy. Allocations are identified by stable handles that survive
//! migration; the current address must always be fetched through
//! [`TieredAllocator::get`].
//!
//! A single mutex guards the handle table and the per-tier counters. Backing
//! allocation, byte copies and backing release all run outside it, so
//! independent allocator traffic never waits on an I/O copy. Lock order when
//! more than one is held: allocator, then pool, then spill queue.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, VgpuError};

use super::pool::{MappedPool, DEFAULT_VRAM_DIR, DEFAULT_VSSD_DIR};
use super::record::AllocationRecord;
use super::region::{AllocHandle, Region};
use super::spill::{
    SpillConfig, SpillExecutor, SpillJob, SpillKind, EVICT_PRIORITY, PROMOTE_PRIORITY,
};
use super::tier::MemoryTier;

/// Alignment of fast-tier (heap) allocations
const FAST_ALIGN: usize = 64;

/// Configuration for the tiered allocator
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Fast-tier byte limit; `0` auto-detects 70% of available RAM
    pub fast_limit: usize,
    /// Medium-tier byte limit; `0` selects the vram pool default (16 GiB)
    pub medium_limit: u64,
    /// Slow-tier byte limit; `0` means bounded only by free disk space
    pub slow_limit: u64,
    /// Fast-tier pressure ratio that triggers eviction
    pub pressure_threshold: f64,
    /// Access count beyond which a slower-tier record is promoted
    pub promotion_threshold: u64,
    /// Run migration copies through the spill executor
    pub async_spill: bool,
    /// Directory for the medium tier's backing files
    pub vram_dir: PathBuf,
    /// Directory for the slow tier's backing files
    pub vssd_dir: PathBuf,
    /// Spill executor configuration
    pub spill: SpillConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            fast_limit: 0,
            medium_limit: 0,
            slow_limit: 0,
            pressure_threshold: 0.8,
            promotion_threshold: 10,
            async_spill: true,
            vram_dir: PathBuf::from(DEFAULT_VRAM_DIR),
            vssd_dir: PathBuf::from(DEFAULT_VSSD_DIR),
            spill: SpillConfig::default(),
        }
    }
}

impl AllocatorConfig {
    /// Set the fast-tier limit in bytes
    pub fn fast_limit(mut self, bytes: usize) -> Self {
        self.fast_limit = bytes;
        self
    }

    /// Set the medium-tier limit in bytes
    pub fn medium_limit(mut self, bytes: u64) -> Self {
        self.medium_limit = bytes;
        self
    }

    /// Set the slow-tier limit in bytes
    pub fn slow_limit(mut self, bytes: u64) -> Self {
        self.slow_limit = bytes;
        self
    }

    /// Set the pressure threshold (ratio in `(0, 1]`)
    pub fn pressure_threshold(mut self, ratio: f64) -> Self {
        self.pressure_threshold = ratio;
        self
    }

    /// Enable or disable asynchronous migration copies
    pub fn async_spill(mut self, enabled: bool) -> Self {
        self.async_spill = enabled;
        self
    }

    /// Set both pool directories
    pub fn pool_dirs(mut self, vram: impl Into<PathBuf>, vssd: impl Into<PathBuf>) -> Self {
        self.vram_dir = vram.into();
        self.vssd_dir = vssd.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.pressure_threshold > 0.0 && self.pressure_threshold <= 1.0) {
            return Err(VgpuError::InvalidArgument(format!(
                "pressure threshold must be in (0, 1], got {}",
                self.pressure_threshold
            )));
        }
        if self.promotion_threshold == 0 {
            return Err(VgpuError::InvalidArgument(
                "promotion threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Used/limit pair for one tier
#[derive(Debug, Clone, Copy, Default)]
pub struct TierUsage {
    /// Bytes resident in the tier
    pub used: usize,
    /// The tier's byte limit
    pub limit: usize,
}

/// Snapshot of allocator state
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    /// Fast-tier usage
    pub fast: TierUsage,
    /// Medium-tier usage
    pub medium: TierUsage,
    /// Slow-tier usage
    pub slow: TierUsage,
    /// Live handle count
    pub live_records: usize,
    /// Cumulative migrations toward slower tiers
    pub evictions: u64,
    /// Cumulative migrations toward faster tiers
    pub promotions: u64,
}

struct AllocInner {
    records: HashMap<u64, AllocationRecord>,
    /// Bytes resident per tier; equals the sum of record sizes per tier at
    /// every lock release
    used: [usize; 3],
    /// Destination bytes of in-flight allocations and migrations, reserved
    /// so concurrent placements cannot oversubscribe a tier
    reserved: [usize; 3],
    limit: [usize; 3],
    next_handle: u64,
    evictions: u64,
    promotions: u64,
    pressure_threshold: f64,
    promotion_threshold: u64,
    async_spill: bool,
}

struct AllocShared {
    inner: Mutex<AllocInner>,
    /// Signalled whenever a migration clears its in-flight flag
    migration_cv: Condvar,
    medium: MappedPool,
    slow: MappedPool,
    spill: SpillExecutor,
}

impl AllocShared {
    /// Reserve capacity and obtain backing in `tier`; `None` on refusal
    fn try_alloc_tier(&self, size: usize, tier: MemoryTier) -> Option<Region> {
        {
            let mut inner = self.inner.lock();
            let i = tier.index();
            if inner.used[i] + inner.reserved[i] + size > inner.limit[i] {
                return None;
            }
            inner.reserved[i] += size;
        }

        let region = match tier {
            MemoryTier::Fast => heap_alloc(size),
            MemoryTier::Medium => self.medium.allocate(size),
            MemoryTier::Slow => self.slow.allocate(size),
        };

        if region.is_none() {
            self.inner.lock().reserved[tier.index()] -= size;
        }
        region
    }

    fn release_backing(&self, region: Region, tier: MemoryTier) {
        match tier {
            MemoryTier::Fast => heap_free(region),
            MemoryTier::Medium => self.medium.deallocate(region),
            MemoryTier::Slow => self.slow.deallocate(region),
        }
    }

    /// Move one record to `target`; promotion and demotion share this path.
    ///
    /// Returns `false` when the handle is unknown, a migration is already in
    /// flight, or the target tier has no capacity. With async spill the copy
    /// is queued and `true` means the destination is secured and the commit
    /// will follow.
    fn migrate(self: &Arc<Self>, handle: AllocHandle, target: MemoryTier) -> bool {
        // Phase 1: mark the record in flight and snapshot its placement.
        let (src, from, size, use_async) = {
            let mut inner = self.inner.lock();
            let async_spill = inner.async_spill;
            let Some(rec) = inner.records.get_mut(&handle.raw()) else {
                return false;
            };
            if rec.migrating {
                return false;
            }
            if rec.tier == target {
                return true;
            }
            rec.migrating = true;
            (rec.region, rec.tier, rec.size, async_spill)
        };

        // Phase 2: secure the destination without holding the table lock.
        let Some(dst) = self.try_alloc_tier(size, target) else {
            let mut inner = self.inner.lock();
            if let Some(rec) = inner.records.get_mut(&handle.raw()) {
                rec.migrating = false;
            }
            drop(inner);
            self.migration_cv.notify_all();
            return false;
        };

        let (kind, priority) = if target.is_faster_than(from) {
            (SpillKind::Promote, PROMOTE_PRIORITY)
        } else {
            (SpillKind::Evict, EVICT_PRIORITY)
        };

        // Phase 3: copy, then commit under the lock.
        if use_async {
            let shared = Arc::clone(self);
            let job = SpillJob::new(src.as_ptr(), dst.as_mut_ptr(), size, kind, priority)
                .on_complete(move |ok| {
                    shared.finish_migration(handle, from, target, dst, ok);
                });
            self.spill.submit(job);
            true
        } else {
            // Safety: source stays mapped while the in-flight flag is set
            // and the destination was just obtained from its pool.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), size) };
            self.finish_migration(handle, from, target, dst, true)
        }
    }

    /// Commit or abort a migration: swap region and tier atomically with the
    /// accounting, then release the superseded backing.
    fn finish_migration(
        &self,
        handle: AllocHandle,
        from: MemoryTier,
        to: MemoryTier,
        dst: Region,
        ok: bool,
    ) -> bool {
        let mut inner = self.inner.lock();
        let ti = to.index();

        if !inner.records.contains_key(&handle.raw()) {
            // Deallocate waits out in-flight migrations, so the record
            // cannot vanish; release the destination if it somehow did.
            inner.reserved[ti] -= dst.len;
            drop(inner);
            self.migration_cv.notify_all();
            self.release_backing(dst, to);
            return false;
        }

        if !ok {
            // Failed copy: the record keeps its original placement and the
            // accounting never sees the destination.
            if let Some(rec) = inner.records.get_mut(&handle.raw()) {
                rec.migrating = false;
            }
            inner.reserved[ti] -= dst.len;
            drop(inner);
            self.migration_cv.notify_all();
            let err = VgpuError::SpillFailed(format!("copy {from} -> {to} for {handle}"));
            warn!(error = %err, "migration aborted, record stays in place");
            self.release_backing(dst, to);
            return false;
        }

        let (old, size) = {
            let rec = inner
                .records
                .get_mut(&handle.raw())
                .expect("record checked above");
            let old = rec.region;
            rec.region = dst;
            rec.tier = to;
            rec.migrating = false;
            (old, rec.size)
        };
        inner.used[from.index()] -= size;
        inner.used[ti] += size;
        inner.reserved[ti] -= size;
        if to.is_faster_than(from) {
            inner.promotions += 1;
        } else {
            inner.evictions += 1;
        }
        drop(inner);
        self.migration_cv.notify_all();
        self.release_backing(old, from);
        true
    }

    /// Demote the LRU unpinned fast-tier record when usage exceeds the
    /// pressure threshold; one eviction attempt per call.
    fn check_pressure(self: &Arc<Self>) {
        let victim = {
            let inner = self.inner.lock();
            let f = MemoryTier::Fast.index();
            if inner.limit[f] == 0
                || (inner.used[f] as f64 / inner.limit[f] as f64) <= inner.pressure_threshold
            {
                return;
            }
            inner
                .records
                .iter()
                .filter(|(_, r)| r.tier == MemoryTier::Fast && r.is_evictable())
                .min_by_key(|(_, r)| r.last_access)
                .map(|(&id, _)| AllocHandle::new(id))
        };

        let Some(victim) = victim else { return };
        debug!(%victim, "fast tier over pressure threshold, demoting LRU record");
        if !self.migrate(victim, MemoryTier::Medium) && !self.migrate(victim, MemoryTier::Slow) {
            debug!(%victim, "no slower tier has capacity, eviction abandoned");
        }
    }
}

/// Three-tier allocator with handle indirection, pressure-driven eviction
/// and hot-data promotion
pub struct TieredAllocator {
    shared: Arc<AllocShared>,
}

impl TieredAllocator {
    /// Create an allocator from a configuration
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration values or when a pool directory
    /// cannot be created.
    pub fn new(config: AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let fast_limit = if config.fast_limit == 0 {
            (available_ram() as f64 * 0.7) as usize
        } else {
            config.fast_limit
        };

        let medium = MappedPool::vram(&config.vram_dir, config.medium_limit).map_err(|e| {
            VgpuError::InvalidArgument(format!(
                "cannot create vram pool at {}: {e}",
                config.vram_dir.display()
            ))
        })?;
        let slow = MappedPool::vssd(&config.vssd_dir, config.slow_limit).map_err(|e| {
            VgpuError::InvalidArgument(format!(
                "cannot create vssd pool at {}: {e}",
                config.vssd_dir.display()
            ))
        })?;

        let medium_limit = medium.total_bytes() as usize;
        let slow_limit = if config.slow_limit == 0 {
            usize::MAX
        } else {
            config.slow_limit as usize
        };

        Ok(Self {
            shared: Arc::new(AllocShared {
                inner: Mutex::new(AllocInner {
                    records: HashMap::new(),
                    used: [0; 3],
                    reserved: [0; 3],
                    limit: [fast_limit, medium_limit, slow_limit],
                    next_handle: 1,
                    evictions: 0,
                    promotions: 0,
                    pressure_threshold: config.pressure_threshold,
                    promotion_threshold: config.promotion_threshold,
                    async_spill: config.async_spill,
                }),
                migration_cv: Condvar::new(),
                medium,
                slow,
                spill: SpillExecutor::new(config.spill),
            }),
        })
    }

    /// Create an allocator with default limits and directories
    pub fn with_defaults() -> Result<Self> {
        Self::new(AllocatorConfig::default())
    }

    /// Allocate `size` bytes, preferring `preferred` and falling through to
    /// slower tiers on refusal
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when every tier refuses; `InvalidArgument` for a
    /// zero-size request.
    pub fn allocate(&self, size: usize, preferred: MemoryTier) -> Result<AllocHandle> {
        if size == 0 {
            return Err(VgpuError::InvalidArgument(
                "cannot allocate 0 bytes".to_string(),
            ));
        }

        let mut tier = preferred;
        loop {
            self.shared.check_pressure();

            if let Some(region) = self.shared.try_alloc_tier(size, tier) {
                let mut inner = self.shared.inner.lock();
                let id = inner.next_handle;
                inner.next_handle += 1;
                inner
                    .records
                    .insert(id, AllocationRecord::new(region, tier, size));
                inner.used[tier.index()] += size;
                inner.reserved[tier.index()] -= size;
                return Ok(AllocHandle::new(id));
            }

            match tier.next_slower() {
                Some(next) => tier = next,
                None => return Err(VgpuError::OutOfMemory { requested: size }),
            }
        }
    }

    /// Release an allocation; no-op on unknown handles
    ///
    /// Waits out any in-flight migration so the final region is the one
    /// released.
    pub fn deallocate(&self, handle: AllocHandle) {
        let (region, tier) = {
            let mut inner = self.shared.inner.lock();
            loop {
                let migrating = match inner.records.get(&handle.raw()) {
                    None => return,
                    Some(rec) => rec.migrating,
                };
                if !migrating {
                    break;
                }
                self.shared.migration_cv.wait(&mut inner);
            }
            match inner.records.remove(&handle.raw()) {
                Some(rec) => {
                    inner.used[rec.tier.index()] -= rec.size;
                    (rec.region, rec.tier)
                }
                None => return,
            }
        };
        self.shared.release_backing(region, tier);
    }

    /// Current base address of the allocation; `None` for unknown handles
    ///
    /// Stamps the access metadata and schedules a promotion once the record
    /// has accumulated more than the promotion threshold of accesses and the
    /// fast tier has room. With async spill the promotion copy is queued and
    /// the new placement becomes visible once the spill executor drains;
    /// only with async spill disabled does this call await the copy. The
    /// returned pointer is valid until the next migration of this handle;
    /// re-fetch after any operation that may move it.
    pub fn get(&self, handle: AllocHandle) -> Option<NonNull<u8>> {
        let (ptr, promote) = {
            let mut inner = self.shared.inner.lock();
            let threshold = inner.promotion_threshold;
            let (ptr, wants, size) = match inner.records.get_mut(&handle.raw()) {
                None => return None,
                Some(rec) => {
                    rec.touch();
                    let wants = rec.tier != MemoryTier::Fast
                        && !rec.migrating
                        && rec.access_count > threshold;
                    (rec.region.as_mut_ptr(), wants, rec.size)
                }
            };
            let f = MemoryTier::Fast.index();
            let fits = inner.used[f] + inner.reserved[f] + size <= inner.limit[f];
            (ptr, wants && fits)
        };

        if promote {
            let _ = self.shared.migrate(handle, MemoryTier::Fast);
        }
        NonNull::new(ptr)
    }

    /// Mark the record ineligible for eviction; no-op on unknown handles
    pub fn pin(&self, handle: AllocHandle) {
        if let Some(rec) = self.shared.inner.lock().records.get_mut(&handle.raw()) {
            rec.pinned = true;
        }
    }

    /// Clear the eviction exclusion; no-op on unknown handles
    pub fn unpin(&self, handle: AllocHandle) {
        if let Some(rec) = self.shared.inner.lock().records.get_mut(&handle.raw()) {
            rec.pinned = false;
        }
    }

    /// Move the record to a faster tier
    ///
    /// Succeeds unless the handle is unknown, a migration is already in
    /// flight, or the target has no capacity.
    pub fn promote(&self, handle: AllocHandle, target: MemoryTier) -> bool {
        self.shared.migrate(handle, target)
    }

    /// Move the record to a slower tier; symmetric with [`Self::promote`]
    pub fn demote(&self, handle: AllocHandle, target: MemoryTier) -> bool {
        self.shared.migrate(handle, target)
    }

    /// The record's current tier; `None` for unknown handles
    pub fn tier_of(&self, handle: AllocHandle) -> Option<MemoryTier> {
        self.shared
            .inner
            .lock()
            .records
            .get(&handle.raw())
            .map(|rec| rec.tier)
    }

    /// Snapshot of per-tier usage and cumulative counters
    pub fn stats(&self) -> AllocatorStats {
        let inner = self.shared.inner.lock();
        let slow_limit = if inner.limit[2] == usize::MAX {
            self.shared.slow.total_bytes() as usize
        } else {
            inner.limit[2]
        };
        AllocatorStats {
            fast: TierUsage {
                used: inner.used[0],
                limit: inner.limit[0],
            },
            medium: TierUsage {
                used: inner.used[1],
                limit: inner.limit[1],
            },
            slow: TierUsage {
                used: inner.used[2],
                limit: slow_limit,
            },
            live_records: inner.records.len(),
            evictions: inner.evictions,
            promotions: inner.promotions,
        }
    }

    /// Cumulative spill-executor statistics
    pub fn spill_stats(&self) -> super::spill::SpillStats {
        self.shared.spill.stats()
    }

    /// Adjust one tier's byte limit
    ///
    /// Applies to placement decisions only; existing residents are not
    /// moved.
    pub fn set_tier_limit(&self, tier: MemoryTier, bytes: usize) {
        self.shared.inner.lock().limit[tier.index()] = bytes;
    }

    /// Adjust the fast-tier pressure threshold, clamped to `(0, 1]`
    pub fn set_pressure_threshold(&self, ratio: f64) {
        self.shared.inner.lock().pressure_threshold = ratio.clamp(f64::MIN_POSITIVE, 1.0);
    }

    /// Switch migration copies between the spill executor and inline copies
    pub fn set_async_spill(&self, enabled: bool) {
        self.shared.inner.lock().async_spill = enabled;
    }

    /// Block until every queued migration copy has completed
    pub fn wait_pending(&self) {
        self.shared.spill.wait_all();
    }
}

impl Drop for TieredAllocator {
    fn drop(&mut self) {
        // Flush in-flight migrations first so no hook touches the table
        // after it is drained.
        self.shared.spill.shutdown();

        let records: Vec<AllocationRecord> = {
            let mut inner = self.shared.inner.lock();
            inner.used = [0; 3];
            inner.records.drain().map(|(_, rec)| rec).collect()
        };
        for rec in records {
            self.shared.release_backing(rec.region, rec.tier);
        }
    }
}

/// Fast-tier backing comes zeroed, like the file-backed tiers
fn heap_alloc(size: usize) -> Option<Region> {
    let layout = Layout::from_size_align(size, FAST_ALIGN).ok()?;
    // Safety: size is non-zero (checked by every caller) and the layout is
    // valid.
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        None
    } else {
        Some(Region::new(ptr as usize, size))
    }
}

fn heap_free(region: Region) {
    if region.is_empty() {
        return;
    }
    if let Ok(layout) = Layout::from_size_align(region.len, FAST_ALIGN) {
        // Safety: the region came from heap_alloc with the same layout.
        unsafe { dealloc(region.as_mut_ptr(), layout) };
    }
}

/// Available physical memory in bytes, with a conservative fallback
#[cfg(target_os = "linux")]
fn available_ram() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        pages as u64 * page_size as u64
    } else {
        8 * 1024 * 1024 * 1024
    }
}

#[cfg(not(target_os = "linux"))]
fn available_ram() -> u64 {
    8 * 1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn test_allocator(fast_limit: usize) -> (tempfile::TempDir, TieredAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let config = AllocatorConfig::default()
            .fast_limit(fast_limit)
            .medium_limit(256 * MIB as u64)
            .slow_limit(256 * MIB as u64)
            .async_spill(false)
            .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
        let alloc = TieredAllocator::new(config).unwrap();
        (dir, alloc)
    }

    #[test]
    fn test_allocate_and_get() {
        let (_dir, alloc) = test_allocator(16 * MIB);

        let h = alloc.allocate(4096, MemoryTier::Fast).unwrap();
        assert_eq!(alloc.tier_of(h), Some(MemoryTier::Fast));

        let ptr = alloc.get(h).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 4096) };

        alloc.deallocate(h);
        assert!(alloc.get(h).is_none());
    }

    #[test]
    fn test_deallocate_idempotent() {
        let (_dir, alloc) = test_allocator(16 * MIB);
        let h = alloc.allocate(1024, MemoryTier::Fast).unwrap();
        alloc.deallocate(h);
        alloc.deallocate(h);
        alloc.deallocate(AllocHandle::new(999));
        assert_eq!(alloc.stats().live_records, 0);
    }

    #[test]
    fn test_tier_fallthrough() {
        let dir = tempfile::tempdir().unwrap();
        let config = AllocatorConfig::default()
            .fast_limit(MIB)
            .medium_limit(256 * MIB as u64)
            .slow_limit(256 * MIB as u64)
            // Disable pressure eviction so the fall-through itself is
            // observable.
            .pressure_threshold(1.0)
            .async_spill(false)
            .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
        let alloc = TieredAllocator::new(config).unwrap();

        // Fast holds one record at most; the second falls through.
        let a = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
        let b = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
        assert_eq!(alloc.tier_of(a), Some(MemoryTier::Fast));
        assert_eq!(alloc.tier_of(b), Some(MemoryTier::Medium));
    }

    #[test]
    fn test_out_of_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = AllocatorConfig::default()
            .fast_limit(1024)
            .medium_limit(1024)
            .slow_limit(1024)
            .async_spill(false)
            .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
        let alloc = TieredAllocator::new(config).unwrap();

        let err = alloc.allocate(MIB, MemoryTier::Fast).unwrap_err();
        assert!(matches!(err, VgpuError::OutOfMemory { requested } if requested == MIB));
        assert_eq!(alloc.stats().live_records, 0);
    }

    #[test]
    fn test_explicit_migration_preserves_content() {
        let (_dir, alloc) = test_allocator(16 * MIB);

        let h = alloc.allocate(8192, MemoryTier::Fast).unwrap();
        let ptr = alloc.get(h).unwrap();
        let pattern: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        unsafe {
            std::ptr::copy_nonoverlapping(pattern.as_ptr(), ptr.as_ptr(), 8192);
        }

        assert!(alloc.demote(h, MemoryTier::Slow));
        assert_eq!(alloc.tier_of(h), Some(MemoryTier::Slow));

        let ptr = alloc.get(h).unwrap();
        let read = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8192) };
        assert_eq!(read, &pattern[..]);
    }

    #[test]
    fn test_migration_to_full_tier_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = AllocatorConfig::default()
            .fast_limit(MIB)
            .medium_limit(4096)
            .slow_limit(4096)
            .async_spill(false)
            .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
        let alloc = TieredAllocator::new(config).unwrap();

        let h = alloc.allocate(64 * 1024, MemoryTier::Fast).unwrap();
        assert!(!alloc.demote(h, MemoryTier::Medium));
        assert_eq!(alloc.tier_of(h), Some(MemoryTier::Fast));

        // Accounting unchanged by the failed migration.
        let stats = alloc.stats();
        assert_eq!(stats.fast.used, 64 * 1024);
        assert_eq!(stats.medium.used, 0);
    }

    #[test]
    fn test_stats_accounting() {
        let (_dir, alloc) = test_allocator(16 * MIB);

        let h1 = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
        let h2 = alloc.allocate(2 * MIB, MemoryTier::Medium).unwrap();

        let stats = alloc.stats();
        assert_eq!(stats.fast.used, MIB);
        assert_eq!(stats.medium.used, 2 * MIB);
        assert_eq!(stats.live_records, 2);

        alloc.deallocate(h1);
        alloc.deallocate(h2);
        let stats = alloc.stats();
        assert_eq!(stats.fast.used, 0);
        assert_eq!(stats.medium.used, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(AllocatorConfig::default()
            .pressure_threshold(1.5)
            .validate()
            .is_err());
        assert!(AllocatorConfig::default()
            .pressure_threshold(0.0)
            .validate()
            .is_err());
        assert!(AllocatorConfig::default().validate().is_ok());
    }
}
