//! Per-allocation metadata tracked by the tiered allocator

use std::time::Instant;

use super::region::Region;
use super::tier::MemoryTier;

/// Metadata for one live allocation
///
/// Mutated only while the allocator lock is held. `migrating` marks a record
/// whose bytes are being copied to another tier; its region and tier stay
/// valid until the migration commits.
#[derive(Debug)]
pub(crate) struct AllocationRecord {
    /// Current backing region; always inside `tier`'s pool
    pub region: Region,
    /// Current tier
    pub tier: MemoryTier,
    /// User-requested byte count; fixed at creation
    pub size: usize,
    /// Stamped on every dereference
    pub last_access: Instant,
    /// Monotonically non-decreasing dereference counter
    pub access_count: u64,
    /// While set, the record is ineligible for eviction
    pub pinned: bool,
    /// An inter-tier copy is in flight for this record
    pub migrating: bool,
}

impl AllocationRecord {
    pub fn new(region: Region, tier: MemoryTier, size: usize) -> Self {
        Self {
            region,
            tier,
            size,
            last_access: Instant::now(),
            access_count: 0,
            pinned: false,
            migrating: false,
        }
    }

    /// Stamp an access
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_count += 1;
    }

    /// Whether the pressure path may demote this record
    pub fn is_evictable(&self) -> bool {
        !self.pinned && !self.migrating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_increments() {
        let mut rec = AllocationRecord::new(Region::new(0x1000, 64), MemoryTier::Fast, 64);
        assert_eq!(rec.access_count, 0);
        rec.touch();
        rec.touch();
        assert_eq!(rec.access_count, 2);
    }

    #[test]
    fn test_evictable() {
        let mut rec = AllocationRecord::new(Region::new(0x1000, 64), MemoryTier::Fast, 64);
        assert!(rec.is_evictable());
        rec.pinned = true;
        assert!(!rec.is_evictable());
        rec.pinned = false;
        rec.migrating = true;
        assert!(!rec.is_evictable());
    }
}
