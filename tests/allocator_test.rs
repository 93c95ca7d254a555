//! Tiered allocator integration: accounting, migration integrity, pressure
//! eviction, pinning and hot promotion

use rand::RngCore;

use vgpu::memory::{AllocatorConfig, MemoryTier, TieredAllocator};

const MIB: usize = 1024 * 1024;

fn allocator_with(
    dir: &tempfile::TempDir,
    fast_limit: usize,
    pressure: f64,
) -> TieredAllocator {
    let config = AllocatorConfig::default()
        .fast_limit(fast_limit)
        .medium_limit(512 * MIB as u64)
        .slow_limit(512 * MIB as u64)
        .pressure_threshold(pressure)
        .async_spill(false)
        .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
    TieredAllocator::new(config).unwrap()
}

fn write_pattern(alloc: &TieredAllocator, handle: vgpu::AllocHandle, data: &[u8]) {
    let ptr = alloc.get(handle).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
}

fn read_back(alloc: &TieredAllocator, handle: vgpu::AllocHandle, len: usize) -> Vec<u8> {
    let ptr = alloc.get(handle).unwrap();
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len).to_vec() }
}

#[test]
fn accounting_matches_live_records() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 64 * MIB, 1.0);

    let mut handles = Vec::new();
    let mut expected_total = 0usize;
    for i in 1..=20 {
        let size = i * 64 * 1024;
        expected_total += size;
        handles.push((alloc.allocate(size, MemoryTier::Fast).unwrap(), size));
    }

    let stats = alloc.stats();
    assert_eq!(stats.live_records, 20);
    assert_eq!(
        stats.fast.used + stats.medium.used + stats.slow.used,
        expected_total
    );

    // Migrations move bytes between counters without losing any.
    for &(h, _) in handles.iter().take(5) {
        assert!(alloc.demote(h, MemoryTier::Slow));
    }
    let stats = alloc.stats();
    assert_eq!(
        stats.fast.used + stats.medium.used + stats.slow.used,
        expected_total
    );

    // Deallocation debits the owning tier exactly.
    for (h, size) in handles {
        alloc.deallocate(h);
        expected_total -= size;
        let stats = alloc.stats();
        assert_eq!(
            stats.fast.used + stats.medium.used + stats.slow.used,
            expected_total
        );
    }
    assert_eq!(alloc.stats().live_records, 0);
}

#[test]
fn content_survives_every_tier_pair() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 64 * MIB, 1.0);

    let size = 256 * 1024;
    let mut pattern = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut pattern);

    let h = alloc.allocate(size, MemoryTier::Fast).unwrap();
    write_pattern(&alloc, h, &pattern);

    // Walk every ordered tier pair at least once.
    let walk = [
        MemoryTier::Medium,
        MemoryTier::Slow,
        MemoryTier::Medium,
        MemoryTier::Fast,
        MemoryTier::Slow,
        MemoryTier::Fast,
    ];
    for &target in &walk {
        let before = alloc.tier_of(h).unwrap();
        assert!(alloc.demote(h, target) || alloc.promote(h, target));
        assert_eq!(alloc.tier_of(h), Some(target), "{before} -> {target}");
        assert_eq!(read_back(&alloc, h, size), pattern, "{before} -> {target}");
    }

    alloc.deallocate(h);
}

#[test]
fn pressure_demotes_lru_records() {
    // 100 records of 1 MiB against a 64 MiB fast tier at 0.8 pressure:
    // the fast tier settles just above the threshold and everything else
    // spills to medium.
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 64 * MIB, 0.8);

    let handles: Vec<_> = (0..100)
        .map(|_| alloc.allocate(MIB, MemoryTier::Fast).unwrap())
        .collect();

    let medium_count = handles
        .iter()
        .filter(|&&h| alloc.tier_of(h) == Some(MemoryTier::Medium))
        .count();
    assert!(medium_count >= 36, "only {medium_count} records demoted");

    let stats = alloc.stats();
    assert_eq!(stats.fast.used + stats.medium.used + stats.slow.used, 100 * MIB);
    assert!(stats.evictions >= 36);
}

#[test]
fn pinned_record_is_never_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 4 * MIB, 0.8);

    // The pinned record is the LRU choice the whole time.
    let pinned = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
    alloc.pin(pinned);

    for _ in 0..16 {
        let _ = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
    }

    assert_eq!(alloc.tier_of(pinned), Some(MemoryTier::Fast));

    // Once unpinned it becomes eligible again.
    alloc.unpin(pinned);
    let _ = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
    let _ = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
    assert_ne!(alloc.tier_of(pinned), Some(MemoryTier::Fast));
}

#[test]
fn hot_record_is_promoted() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 64 * MIB, 1.0);

    let h = alloc.allocate(MIB, MemoryTier::Slow).unwrap();
    assert_eq!(alloc.tier_of(h), Some(MemoryTier::Slow));

    // Ten accesses stay put; the eleventh crosses the threshold.
    for _ in 0..10 {
        alloc.get(h).unwrap();
        assert_eq!(alloc.tier_of(h), Some(MemoryTier::Slow));
    }
    alloc.get(h).unwrap();
    assert_eq!(alloc.tier_of(h), Some(MemoryTier::Fast));

    let stats = alloc.stats();
    assert_eq!(stats.promotions, 1);
}

#[test]
fn promotion_requires_fast_headroom() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 2 * MIB, 1.0);

    // Fill the fast tier completely, then hammer a slow record.
    let _a = alloc.allocate(MIB, MemoryTier::Fast).unwrap();
    let _b = alloc.allocate(MIB, MemoryTier::Fast).unwrap();

    let h = alloc.allocate(MIB, MemoryTier::Slow).unwrap();
    for _ in 0..20 {
        alloc.get(h).unwrap();
    }
    assert_eq!(alloc.tier_of(h), Some(MemoryTier::Slow));
}

#[test]
fn hot_promotion_with_async_spill_is_queued() {
    let dir = tempfile::tempdir().unwrap();
    let config = AllocatorConfig::default()
        .fast_limit(64 * MIB)
        .medium_limit(512 * MIB as u64)
        .slow_limit(512 * MIB as u64)
        .pressure_threshold(1.0)
        .async_spill(true)
        .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
    let alloc = TieredAllocator::new(config).unwrap();

    let size = 128 * 1024;
    let mut pattern = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut pattern);

    let h = alloc.allocate(size, MemoryTier::Slow).unwrap();
    write_pattern(&alloc, h, &pattern);

    // The access crossing the threshold enqueues the copy instead of
    // performing it on this thread; the new placement is visible once the
    // spill executor drains.
    for _ in 0..10 {
        alloc.get(h).unwrap();
    }
    alloc.wait_pending();
    assert_eq!(alloc.tier_of(h), Some(MemoryTier::Fast));
    assert_eq!(read_back(&alloc, h, size), pattern);

    // Accesses past the threshold schedule no duplicate promotions.
    for _ in 0..5 {
        alloc.get(h).unwrap();
    }
    alloc.wait_pending();
    assert_eq!(alloc.stats().promotions, 1);

    alloc.deallocate(h);
}

#[test]
fn async_spill_migrations_settle() {
    let dir = tempfile::tempdir().unwrap();
    let config = AllocatorConfig::default()
        .fast_limit(64 * MIB)
        .medium_limit(512 * MIB as u64)
        .slow_limit(512 * MIB as u64)
        .pressure_threshold(1.0)
        .async_spill(true)
        .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
    let alloc = TieredAllocator::new(config).unwrap();

    let size = 128 * 1024;
    let mut pattern = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut pattern);

    let h = alloc.allocate(size, MemoryTier::Fast).unwrap();
    write_pattern(&alloc, h, &pattern);

    assert!(alloc.demote(h, MemoryTier::Slow));
    alloc.wait_pending();
    assert_eq!(alloc.tier_of(h), Some(MemoryTier::Slow));
    assert_eq!(read_back(&alloc, h, size), pattern);

    // A second migration request for a settled record succeeds too.
    assert!(alloc.promote(h, MemoryTier::Medium));
    alloc.wait_pending();
    assert_eq!(alloc.tier_of(h), Some(MemoryTier::Medium));
    assert_eq!(read_back(&alloc, h, size), pattern);

    alloc.deallocate(h);
    assert_eq!(alloc.stats().live_records, 0);
}

#[test]
fn deallocate_waits_for_inflight_migration() {
    let dir = tempfile::tempdir().unwrap();
    let config = AllocatorConfig::default()
        .fast_limit(256 * MIB)
        .medium_limit(512 * MIB as u64)
        .slow_limit(512 * MIB as u64)
        .pressure_threshold(1.0)
        .async_spill(true)
        .pool_dirs(dir.path().join("vram"), dir.path().join("vssd"));
    let alloc = TieredAllocator::new(config).unwrap();

    // Large enough that the copy takes observable time.
    let size = 32 * MIB;
    let h = alloc.allocate(size, MemoryTier::Fast).unwrap();
    assert!(alloc.demote(h, MemoryTier::Slow));

    // Deallocate while the spill job may still be copying; the allocator
    // must order it after the migration commits.
    alloc.deallocate(h);
    assert!(alloc.tier_of(h).is_none());

    let stats = alloc.stats();
    assert_eq!(stats.fast.used + stats.medium.used + stats.slow.used, 0);
    assert_eq!(stats.live_records, 0);
}

#[test]
fn unknown_handles_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let alloc = allocator_with(&dir, 4 * MIB, 1.0);

    let h = alloc.allocate(1024, MemoryTier::Fast).unwrap();
    alloc.deallocate(h);

    assert!(alloc.get(h).is_none());
    assert!(alloc.tier_of(h).is_none());
    alloc.pin(h);
    alloc.unpin(h);
    alloc.deallocate(h);
    assert!(!alloc.promote(h, MemoryTier::Fast));
    assert!(!alloc.demote(h, MemoryTier::Slow));
}
