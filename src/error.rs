//! Error types for probe runs.

use std::io;
use thiserror::Error;

/// Errors raised while calibrating, scheduling or validating a probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The clock never advanced within the sampling budget.
    #[error("clock calibration failed: {reason}")]
    Calibration {
        /// What the calibration loop observed
        reason: String,
    },

    /// A worker thread could not be created, so the pass was abandoned.
    #[error("failed to spawn worker {worker} of {threads}: {source}")]
    Spawn {
        /// Index of the worker that failed to start
        worker: usize,
        /// Size of the requested pool
        threads: usize,
        /// Underlying OS error
        source: io::Error,
    },

    /// The doubling loop ran out of batch sizes before the threshold was met.
    #[error("timing did not converge: {iterations} iterations took {aggregate:.3e}s, need {threshold:.3e}s")]
    NoConvergence {
        /// Batch size of the last round
        iterations: u64,
        /// Seconds taken by the last round
        aggregate: f64,
        /// Seconds the round had to reach
        threshold: f64,
    },

    /// A worker could not be pinned to the requested core.
    #[error("failed to pin worker {worker} to core {core}: {source}")]
    Affinity {
        /// Index of the worker that could not be pinned
        worker: usize,
        /// Core it was to be pinned to
        core: usize,
        /// Underlying OS error
        source: io::Error,
    },

    /// A tolerance, thread count or dimension was rejected before any work ran.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A concurrent result disagreed with its sequential reference.
    #[error("result mismatch at {location}: expected {expected}, got {actual}")]
    Mismatch {
        /// Where the disagreement was found
        location: String,
        /// Reference value
        expected: u64,
        /// Value produced by the concurrent path
        actual: u64,
    },

    /// The last scheduling pass was abandoned; its output matrix is partial.
    #[error("scheduling pass did not complete; no result is available")]
    IncompletePass,

    /// Reading or writing a report failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A report could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ProbeError>;

pub(crate) fn invalid_config(message: impl Into<String>) -> ProbeError {
    ProbeError::InvalidConfig(message.into())
}
