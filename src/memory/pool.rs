//! Backing-store pools for the mapped tiers
//!
//! Each pool owns a directory and maps one anonymous backing file per live
//! allocation into the process address space. The vram pool expects its
//! directory on an in-memory filesystem and is bounded by a configured
//! ceiling; the vssd pool lives on disk and is additionally bounded by the
//! free space of the filesystem that holds it.
//!
//! The mapping table is guarded by a single lock. Filesystem syscalls run
//! outside the critical section; only the table update itself is locked.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::region::Region;

/// Default directory for the vram (in-memory filesystem) pool
pub const DEFAULT_VRAM_DIR: &str = "/tmp/vgpu_vram";

/// Default directory for the vssd (on-disk) pool
pub const DEFAULT_VSSD_DIR: &str = "/tmp/vgpu_vssd";

/// Default vram pool ceiling: 16 GiB
pub const DEFAULT_VRAM_CAPACITY: u64 = 16 * 1024 * 1024 * 1024;

/// Configuration for a mapped pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory holding one backing file per live allocation
    pub dir: PathBuf,
    /// Capacity ceiling in bytes; for disk-bounded pools `0` means bounded
    /// only by free disk space
    pub capacity: u64,
    /// Backing-file name prefix
    pub file_prefix: &'static str,
    /// Clamp the effective ceiling to the filesystem's free space
    pub disk_bounded: bool,
}

struct MappedFile {
    map: MmapMut,
    path: PathBuf,
}

struct PoolInner {
    mappings: HashMap<usize, MappedFile>,
    used: u64,
    next_file_id: u64,
}

/// A pool of file-backed memory mappings inside one directory
pub struct MappedPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl MappedPool {
    /// Create a pool from an explicit configuration
    ///
    /// # Errors
    ///
    /// Fails when the pool directory cannot be created.
    pub fn new(config: PoolConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                mappings: HashMap::new(),
                used: 0,
                next_file_id: 0,
            }),
        })
    }

    /// Create the vram pool: tmpfs-backed, bounded by a fixed ceiling
    ///
    /// `capacity == 0` selects the 16 GiB default.
    pub fn vram(dir: impl AsRef<Path>, capacity: u64) -> io::Result<Self> {
        Self::new(PoolConfig {
            dir: dir.as_ref().to_path_buf(),
            capacity: if capacity == 0 {
                DEFAULT_VRAM_CAPACITY
            } else {
                capacity
            },
            file_prefix: "vram",
            disk_bounded: false,
        })
    }

    /// Create the vssd pool: disk-backed, bounded by
    /// `min(capacity, filesystem free space)`
    ///
    /// `capacity == 0` means bounded only by free disk space.
    pub fn vssd(dir: impl AsRef<Path>, capacity: u64) -> io::Result<Self> {
        Self::new(PoolConfig {
            dir: dir.as_ref().to_path_buf(),
            capacity,
            file_prefix: "vssd",
            disk_bounded: true,
        })
    }

    /// Map a fresh backing file of exactly `size` bytes
    ///
    /// Returns `None` when the pool is at capacity or any filesystem step
    /// refuses; no partial state is left behind.
    pub fn allocate(&self, size: usize) -> Option<Region> {
        if size == 0 {
            return None;
        }

        // Reserve the bytes and claim a file id under the lock; the
        // syscalls below run without it.
        let file_id = {
            let mut inner = self.inner.lock();
            let ceiling = self.effective_capacity(inner.used);
            if inner.used + size as u64 > ceiling {
                return None;
            }
            inner.used += size as u64;
            let id = inner.next_file_id;
            inner.next_file_id += 1;
            id
        };

        let path = self
            .config
            .dir
            .join(format!("{}_{}", self.config.file_prefix, file_id));

        match self.create_and_map(&path, size) {
            Ok(map) => {
                let addr = map.as_ptr() as usize;
                let mut inner = self.inner.lock();
                inner.mappings.insert(addr, MappedFile { map, path });
                Some(Region::new(addr, size))
            }
            Err(e) => {
                debug!(path = %path.display(), size, error = %e, "pool allocation failed");
                let _ = fs::remove_file(&path);
                self.inner.lock().used -= size as u64;
                None
            }
        }
    }

    /// Unmap a region and delete its backing file; idempotent on unknown
    /// regions
    pub fn deallocate(&self, region: Region) {
        let entry = {
            let mut inner = self.inner.lock();
            match inner.mappings.remove(&region.addr) {
                Some(entry) => {
                    inner.used -= entry.map.len() as u64;
                    entry
                }
                None => return,
            }
        };

        // Unmapping and unlinking happen outside the lock.
        let path = entry.path.clone();
        drop(entry);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to unlink backing file");
        }
    }

    /// Bytes currently mapped
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    /// Bytes still available under the effective ceiling
    pub fn free_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        self.effective_capacity(inner.used).saturating_sub(inner.used)
    }

    /// The pool's effective ceiling
    pub fn total_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        self.effective_capacity(inner.used)
    }

    /// The pool's directory
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Whether the pool directory actually lives on a tmpfs mount
    ///
    /// Advisory only; a vram pool on a regular filesystem still works, just
    /// without the in-memory speed.
    pub fn is_tmpfs(&self) -> bool {
        is_on_tmpfs(&self.config.dir)
    }

    fn effective_capacity(&self, used: u64) -> u64 {
        if !self.config.disk_bounded {
            return self.config.capacity;
        }
        let avail = used + available_disk_space(&self.config.dir);
        if self.config.capacity == 0 {
            avail
        } else {
            self.config.capacity.min(avail)
        }
    }

    fn create_and_map(&self, path: &Path, size: usize) -> io::Result<MmapMut> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(path)?;
        file.set_len(size as u64)?;
        // Safety: the mapping is private to this pool and lives in the
        // table until deallocate drops it.
        unsafe { MmapMut::map_mut(&file) }
    }
}

impl Drop for MappedPool {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.mappings.drain() {
            let path = entry.path.clone();
            drop(entry);
            let _ = fs::remove_file(path);
        }
        inner.used = 0;
    }
}

/// Free space of the filesystem holding `path`, in bytes
#[cfg(target_os = "linux")]
fn available_disk_space(path: &Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } == 0 {
        stat.f_bavail as u64 * stat.f_frsize as u64
    } else {
        0
    }
}

#[cfg(not(target_os = "linux"))]
fn available_disk_space(_path: &Path) -> u64 {
    u64::MAX / 2
}

#[cfg(target_os = "linux")]
fn is_on_tmpfs(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    const TMPFS_MAGIC: u64 = 0x0102_1994;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    unsafe { libc::statfs(cpath.as_ptr(), &mut stat) == 0 && stat.f_type as u64 == TMPFS_MAGIC }
}

#[cfg(not(target_os = "linux"))]
fn is_on_tmpfs(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(capacity: u64) -> (tempfile::TempDir, MappedPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = MappedPool::vram(dir.path().join("pool"), capacity).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_allocate_roundtrip() {
        let (_dir, pool) = test_pool(1024 * 1024);

        let region = pool.allocate(4096).unwrap();
        assert_eq!(region.len, 4096);
        assert_eq!(pool.used_bytes(), 4096);

        // The mapping is writable and readable.
        unsafe {
            std::ptr::write_bytes(region.as_mut_ptr(), 0xAB, 4096);
            assert_eq!(*region.as_ptr().add(4095), 0xAB);
        }

        pool.deallocate(region);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn test_capacity_refusal() {
        let (_dir, pool) = test_pool(8192);

        let a = pool.allocate(4096).unwrap();
        let b = pool.allocate(4096).unwrap();
        assert!(pool.allocate(1).is_none());

        pool.deallocate(a);
        assert!(pool.allocate(4096).is_some());
        pool.deallocate(b);
    }

    #[test]
    fn test_deallocate_idempotent() {
        let (_dir, pool) = test_pool(1024 * 1024);

        let region = pool.allocate(4096).unwrap();
        pool.deallocate(region);
        pool.deallocate(region);
        pool.deallocate(Region::new(0xDEAD, 16));
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn test_zero_size_refused() {
        let (_dir, pool) = test_pool(1024);
        assert!(pool.allocate(0).is_none());
    }

    #[test]
    fn test_backing_files_created_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = MappedPool::vssd(dir.path().join("pool"), 1024 * 1024).unwrap();

        let region = pool.allocate(4096).unwrap();
        let files: Vec<_> = fs::read_dir(pool.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);

        pool.deallocate(region);
        let files: Vec<_> = fs::read_dir(pool.dir()).unwrap().collect();
        assert!(files.is_empty());
    }

    #[test]
    fn test_free_bytes_accounting() {
        let (_dir, pool) = test_pool(16384);
        assert_eq!(pool.free_bytes(), 16384);
        let r = pool.allocate(4096).unwrap();
        assert_eq!(pool.free_bytes(), 12288);
        assert_eq!(pool.total_bytes(), 16384);
        pool.deallocate(r);
    }
}
