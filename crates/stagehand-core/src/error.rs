//! Typed error hierarchy for the staging executor.
//!
//! Two families matter to callers: precondition violations (bad inputs to a
//! call; nothing was bound or copied) and device/runtime failures (the engine
//! or a transfer failed mid-call; the engine has been reset and the call must
//! be reissued by the serving layer if desired).

/// All errors originating from the stagehand workspace.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── CUDA / transfers ─────────────────────────────────────────────
    #[cfg(feature = "cuda-runtime")]
    #[error("CUDA driver error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("Device copy error: {0}")]
    Copy(String),

    #[error("built without `cuda-runtime`; device-resident buffers and transfers are unavailable")]
    RuntimeDisabled,

    // ── Engine boundary ──────────────────────────────────────────────
    #[error("Pipeline engine error: {0}")]
    Pipeline(String),

    #[error("Copy scheduler error: {0}")]
    Scheduler(String),

    // ── Preconditions ────────────────────────────────────────────────
    #[error("Batch size mismatch: input '{name}' carries {actual} samples, expected {expected}")]
    BatchSizeMismatch {
        name: String,
        expected: i64,
        actual: i64,
    },

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Cannot grow a buffer to {requested} bytes while it holds {filled} filled bytes; clear it first")]
    ReserveWhileFilled { requested: usize, filled: usize },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: CUDA/transfers
    /// - 2xx: engine boundary
    /// - 5xx: preconditions
    /// - 6xx: invariants
    pub fn error_code(&self) -> u32 {
        match self {
            #[cfg(feature = "cuda-runtime")]
            Self::Cuda(_) => 100,
            Self::Copy(_) => 101,
            Self::RuntimeDisabled => 102,
            Self::Pipeline(_) => 200,
            Self::Scheduler(_) => 201,
            Self::BatchSizeMismatch { .. } => 500,
            Self::BufferTooSmall { .. } => 501,
            Self::ReserveWhileFilled { .. } => 502,
            Self::InvariantViolation(_) => 600,
        }
    }

    /// Whether this error is a local precondition violation rather than a
    /// device or engine failure.  Precondition errors abort the call before
    /// anything was bound or copied.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::BatchSizeMismatch { .. }
                | Self::BufferTooSmall { .. }
                | Self::ReserveWhileFilled { .. }
                | Self::InvariantViolation(_)
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
