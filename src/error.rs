//! Error types for the vGPU runtime

/// Error types for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum VgpuError {
    /// Caller supplied an invalid shape, stride or configuration value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Every tier refused the allocation
    #[error("out of memory: requested {requested} bytes, no tier has capacity")]
    OutOfMemory {
        /// Size of the refused request in bytes
        requested: usize,
    },

    /// An inter-tier copy job reported failure; the record stays in its
    /// original tier
    #[error("spill failed: {0}")]
    SpillFailed(String),

    /// The autotuner probe produced an implausible timing
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    /// The tuner configuration file could not be read or written
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, VgpuError>;
