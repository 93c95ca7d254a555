//! GEMM tile-size autotuner
//!
//! Chooses the `(MC, KC, NC)` tile triple for the blocked driver: candidate
//! triples are filtered against the detected cache hierarchy, each survivor
//! is timed on a fixed probe problem, and the fastest wins. The selection is
//! persisted to a small JSON file and recalled on the next process start, so
//! the search runs once per machine rather than once per run.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, VgpuError};
use crate::topology::{self, CacheTopology};

use super::gemm::matmul_blocked;

/// Candidate tile sizes on the M axis
pub const MC_CANDIDATES: [usize; 5] = [128, 192, 256, 384, 512];

/// Candidate tile sizes on the K axis
pub const KC_CANDIDATES: [usize; 5] = [64, 96, 128, 192, 256];

/// Candidate tile sizes on the N axis
pub const NC_CANDIDATES: [usize; 3] = [2048, 4096, 8192];

/// Edge length of the square probe problem
pub const DEFAULT_PROBE_SIZE: usize = 512;

const CONFIG_FILE: &str = ".vgpu_tuner.json";

/// Tile sizes for the blocked GEMM driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    /// Tile size on the M axis (rows of `A` kept in L2)
    #[serde(rename = "MC")]
    pub mc: usize,
    /// Tile size on the K axis (shared dimension, bounded by L1)
    #[serde(rename = "KC")]
    pub kc: usize,
    /// Tile size on the N axis (columns of `B` kept in L3)
    #[serde(rename = "NC")]
    pub nc: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            mc: 256,
            kc: 128,
            nc: 4096,
        }
    }
}

impl TileConfig {
    /// Whether the triple respects the cache hierarchy: the A-panel fits in
    /// L2, the micro-kernel working set in L1 and the B-panel in L3
    #[must_use]
    pub fn fits(&self, topo: &CacheTopology) -> bool {
        const S: usize = std::mem::size_of::<f32>();
        self.mc * self.kc * S < topo.l2
            && self.kc * self.kc * S < topo.l1
            && self.kc * self.nc * S < topo.l3
    }

    fn is_plausible(&self) -> bool {
        self.mc > 0 && self.kc > 0 && self.nc > 0
    }
}

impl std::fmt::Display for TileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MC={} KC={} NC={}", self.mc, self.kc, self.nc)
    }
}

/// Online tile-size search with persistent caching
///
/// Accessed process-wide through [`Autotuner::global`]; file I/O is
/// serialised by the single instance.
pub struct Autotuner {
    path: PathBuf,
    probe_size: usize,
    cached: Mutex<Option<TileConfig>>,
}

impl Autotuner {
    /// Create a tuner persisting to `$HOME/.vgpu_tuner.json` (or the working
    /// directory when `HOME` is unset)
    pub fn new() -> Self {
        Self::with_path(default_config_path())
    }

    /// Create a tuner persisting to an explicit path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = load_config(&path);
        Self {
            path,
            probe_size: DEFAULT_PROBE_SIZE,
            cached: Mutex::new(cached),
        }
    }

    /// Override the probe problem size
    #[must_use]
    pub fn probe_size(mut self, n: usize) -> Self {
        self.probe_size = n.max(1);
        self
    }

    /// The process-wide tuner instance, constructed on first use
    pub fn global() -> &'static Autotuner {
        static INSTANCE: OnceLock<Autotuner> = OnceLock::new();
        INSTANCE.get_or_init(Autotuner::new)
    }

    /// Return the cached triple, or run the search
    ///
    /// With `force` the search always reruns and overwrites the persisted
    /// selection.
    pub fn tune(&self, force: bool) -> TileConfig {
        if !force {
            if let Some(cached) = *self.cached.lock() {
                return cached;
            }
        }

        let chosen = self.search();
        *self.cached.lock() = Some(chosen);
        if let Err(e) = save_config(&self.path, &chosen) {
            warn!(error = %e, "tuner selection not persisted");
        }
        chosen
    }

    /// The currently cached triple, or the documented defaults
    pub fn config(&self) -> TileConfig {
        (*self.cached.lock()).unwrap_or_default()
    }

    /// Whether a tuned triple is cached in memory
    pub fn has_cached(&self) -> bool {
        self.cached.lock().is_some()
    }

    /// Drop the cached triple and delete the persisted file; the next
    /// [`Autotuner::tune`] reruns the search
    pub fn reset(&self) {
        *self.cached.lock() = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "cannot remove tuner config");
            }
        }
    }

    /// Detected cache sizes the candidate filter works against
    pub fn cache_sizes(&self) -> CacheTopology {
        topology::cache_sizes()
    }

    /// Cartesian candidate set filtered by the cache hierarchy
    pub fn candidates(topo: &CacheTopology) -> Vec<TileConfig> {
        let mut out = Vec::new();
        for &mc in &MC_CANDIDATES {
            for &kc in &KC_CANDIDATES {
                for &nc in &NC_CANDIDATES {
                    let tiles = TileConfig { mc, kc, nc };
                    if tiles.fits(topo) {
                        out.push(tiles);
                    }
                }
            }
        }
        out
    }

    fn search(&self) -> TileConfig {
        let topo = topology::cache_sizes();
        info!(
            l1_kib = topo.l1 / 1024,
            l2_kib = topo.l2 / 1024,
            l3_kib = topo.l3 / 1024,
            "running autotuner search"
        );

        let candidates = Self::candidates(&topo);
        if candidates.is_empty() {
            warn!("no tile candidate fits the cache hierarchy, using defaults");
            return TileConfig::default();
        }
        info!(count = candidates.len(), "timing tile candidates");

        let mut best = candidates[0];
        let mut best_gflops = 0.0f64;
        for tiles in candidates {
            let gflops = match self.probe(tiles) {
                Ok(gflops) => gflops,
                Err(e) => {
                    warn!(%tiles, error = %e, "candidate skipped");
                    continue;
                }
            };
            if gflops > best_gflops {
                best_gflops = gflops;
                best = tiles;
            }
        }

        info!(%best, gflops = best_gflops, "autotuner selection");
        best
    }

    /// Time one candidate on the probe problem
    ///
    /// # Errors
    ///
    /// `ProbeFailed` when the measured time is implausible.
    fn probe(&self, tiles: TileConfig) -> Result<f64> {
        let n = self.probe_size;
        let mut rng = rand::thread_rng();
        let a: Vec<f32> = (0..n * n).map(|_| rng.gen::<f32>()).collect();
        let b: Vec<f32> = (0..n * n).map(|_| rng.gen::<f32>()).collect();
        let mut c = vec![0.0f32; n * n];

        // One untimed warm-up, one timed run.
        matmul_blocked(n, n, n, &a, &b, &mut c, tiles.mc, tiles.kc, tiles.nc);
        let start = Instant::now();
        matmul_blocked(n, n, n, &a, &b, &mut c, tiles.mc, tiles.kc, tiles.nc);
        let elapsed = start.elapsed().as_secs_f64();

        if elapsed <= 0.0 {
            return Err(VgpuError::ProbeFailed(format!(
                "non-positive elapsed time {elapsed}s for {tiles}"
            )));
        }
        let flops = 2.0 * (n as f64).powi(3);
        Ok(flops / elapsed / 1e9)
    }
}

impl Default for Autotuner {
    fn default() -> Self {
        Self::new()
    }
}

fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(CONFIG_FILE),
        None => PathBuf::from(CONFIG_FILE),
    }
}

fn load_config(path: &Path) -> Option<TileConfig> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<TileConfig>(&text) {
        Ok(tiles) if tiles.is_plausible() => Some(tiles),
        Ok(_) => {
            warn!(path = %path.display(), "tuner config contains zero tile sizes, ignored");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed tuner config, ignored");
            None
        }
    }
}

/// Atomic rewrite: write a sibling temp file, then rename over the target
///
/// # Errors
///
/// `PersistenceFailed` when serialisation or any filesystem step refuses.
fn save_config(path: &Path, tiles: &TileConfig) -> Result<()> {
    let persistence_err = |e: &dyn std::fmt::Display| {
        VgpuError::PersistenceFailed(format!("{}: {e}", path.display()))
    };

    let text = serde_json::to_string_pretty(tiles).map_err(|e| persistence_err(&e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text).map_err(|e| persistence_err(&e))?;
    std::fs::rename(&tmp, path).map_err(|e| persistence_err(&e))
}
