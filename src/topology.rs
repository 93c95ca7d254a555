//! CPU cache and NUMA topology detection
//!
//! Reads per-level data-cache sizes and NUMA node layout from sysfs where
//! the operating system exposes them. Detection never fails: any level that
//! cannot be read falls back to a conservative default, so callers can rely
//! on the returned values unconditionally. Results are detected once per
//! process and memoised.

use std::sync::OnceLock;

/// Default L1 data cache size when detection fails: 32 KiB
pub const DEFAULT_L1: usize = 32 * 1024;

/// Default L2 cache size when detection fails: 256 KiB
pub const DEFAULT_L2: usize = 256 * 1024;

/// Default L3 cache size when detection fails: 8 MiB
pub const DEFAULT_L3: usize = 8 * 1024 * 1024;

/// Detected data-cache sizes in bytes, one field per level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTopology {
    /// L1 data cache size in bytes
    pub l1: usize,
    /// L2 cache size in bytes
    pub l2: usize,
    /// L3 cache size in bytes
    pub l3: usize,
}

impl Default for CacheTopology {
    fn default() -> Self {
        Self {
            l1: DEFAULT_L1,
            l2: DEFAULT_L2,
            l3: DEFAULT_L3,
        }
    }
}

/// One NUMA node: its id, the CPUs it owns and its local memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    /// Node id as reported by the operating system
    pub id: usize,
    /// CPU ids local to this node
    pub cpus: Vec<usize>,
    /// Local memory in bytes (0 when unknown)
    pub memory_bytes: u64,
}

static CACHE_SIZES: OnceLock<CacheTopology> = OnceLock::new();
static NUMA_NODES: OnceLock<Vec<NumaNode>> = OnceLock::new();

/// Detected `(L1, L2, L3)` data-cache sizes, memoised for the process
pub fn cache_sizes() -> CacheTopology {
    *CACHE_SIZES.get_or_init(detect_cache_sizes)
}

/// Detected NUMA nodes, memoised for the process
///
/// Always returns at least one node; on systems without NUMA information
/// the single node 0 owns every CPU.
pub fn numa_topology() -> &'static [NumaNode] {
    NUMA_NODES.get_or_init(detect_numa_nodes)
}

fn detect_cache_sizes() -> CacheTopology {
    #[cfg(target_os = "linux")]
    {
        if let Some(topo) = read_sysfs_caches() {
            return topo;
        }
    }
    CacheTopology::default()
}

/// Parse `/sys/devices/system/cpu/cpu0/cache/index*` records.
///
/// The `size` file uses a `<n>K` / `<n>M` suffix; `type` distinguishes the
/// L1 instruction cache from the data cache we want.
#[cfg(target_os = "linux")]
fn read_sysfs_caches() -> Option<CacheTopology> {
    let mut l1: Option<usize> = None;
    let mut l2: Option<usize> = None;
    let mut l3: Option<usize> = None;

    for idx in 0..8 {
        let base = format!("/sys/devices/system/cpu/cpu0/cache/index{idx}");
        let level = match std::fs::read_to_string(format!("{base}/level")) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let ctype = match std::fs::read_to_string(format!("{base}/type")) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let size = match std::fs::read_to_string(format!("{base}/size")) {
            Ok(s) => s,
            Err(_) => continue,
        };

        let level: u32 = match level.trim().parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let size = match parse_size_suffix(size.trim()) {
            Some(v) => v,
            None => continue,
        };

        match (level, ctype.trim()) {
            (1, "Data") => l1 = Some(size),
            (2, "Unified") | (2, "Data") => l2 = Some(size),
            (3, "Unified") | (3, "Data") => l3 = Some(size),
            _ => {}
        }
    }

    // L3 is genuinely absent on some parts; L1/L2 missing means the sysfs
    // tree is unusable and the defaults apply instead.
    match (l1, l2) {
        (Some(l1), Some(l2)) => Some(CacheTopology {
            l1,
            l2,
            l3: l3.unwrap_or(DEFAULT_L3),
        }),
        _ => None,
    }
}

/// Parse a sysfs size string such as `32K` or `8M` into bytes
fn parse_size_suffix(s: &str) -> Option<usize> {
    if let Some(kb) = s.strip_suffix('K') {
        kb.parse::<usize>().ok().map(|v| v * 1024)
    } else if let Some(mb) = s.strip_suffix('M') {
        mb.parse::<usize>().ok().map(|v| v * 1024 * 1024)
    } else {
        s.parse::<usize>().ok()
    }
}

fn detect_numa_nodes() -> Vec<NumaNode> {
    #[cfg(target_os = "linux")]
    {
        let nodes = read_sysfs_nodes();
        if !nodes.is_empty() {
            return nodes;
        }
    }
    vec![NumaNode {
        id: 0,
        cpus: (0..num_cpus::get()).collect(),
        memory_bytes: 0,
    }]
}

#[cfg(target_os = "linux")]
fn read_sysfs_nodes() -> Vec<NumaNode> {
    let mut nodes = Vec::new();

    for id in 0..64 {
        let base = format!("/sys/devices/system/node/node{id}");
        let cpulist = match std::fs::read_to_string(format!("{base}/cpulist")) {
            Ok(s) => s,
            Err(_) => break,
        };

        let cpus = parse_cpulist(cpulist.trim());
        if cpus.is_empty() {
            continue;
        }

        let memory_bytes = std::fs::read_to_string(format!("{base}/meminfo"))
            .ok()
            .and_then(|s| parse_node_memtotal(&s))
            .unwrap_or(0);

        nodes.push(NumaNode {
            id,
            cpus,
            memory_bytes,
        });
    }

    nodes
}

/// Parse the sysfs cpulist syntax: comma-separated ids and `a-b` ranges
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(id) = part.parse::<usize>() {
            cpus.push(id);
        }
    }
    cpus
}

/// Extract the `MemTotal` line from a node meminfo file, in bytes
#[cfg(target_os = "linux")]
fn parse_node_memtotal(meminfo: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if let Some(pos) = line.find("MemTotal:") {
            let rest = line[pos + "MemTotal:".len()..].trim();
            let kb = rest.trim_end_matches("kB").trim();
            return kb.parse::<u64>().ok().map(|v| v * 1024);
        }
    }
    None
}
