//! Configuration for probe runs.

use crate::clock::CalibrationMethod;
use crate::error::{invalid_config, Result};
use crate::matmul::BlockLayout;
use crate::timing::validate_tolerance;
use log::warn;
use std::path::PathBuf;

/// Configuration for a probe suite.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Maximum relative error of each timing estimate, in (0, 1).
    pub error_tolerance: f64,
    /// Worker threads per scheduling pass.
    pub threads: usize,
    /// Matrix width in blocks.
    pub grid: usize,
    /// Block width in elements.
    pub block: usize,
    /// How the clock resolution is obtained.
    pub calibration: CalibrationMethod,
    /// Batch size of the first timing round.
    pub initial_iterations: u64,
    /// Directory for JSON results; no JSON is written when unset.
    pub output_dir: Option<PathBuf>,
    /// Call each op once, untimed, before measuring it.
    pub warm: bool,
    /// Print result tables to stdout.
    pub verbose: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            error_tolerance: 0.01,
            threads: 10,
            grid: 4,
            block: 16,
            calibration: CalibrationMethod::Sampled,
            initial_iterations: 1,
            output_dir: None,
            warm: false,
            verbose: true,
        }
    }
}

impl ProbeConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse config from environment variables.
    ///
    /// Supported variables:
    /// - `PROBE_TOLERANCE`: relative error bound (default: 0.01)
    /// - `PROBE_THREADS`: worker threads per pass (default: 10)
    /// - `PROBE_GRID`: matrix width in blocks (default: 4)
    /// - `PROBE_BLOCK`: block width in elements (default: 16)
    /// - `PROBE_CALIBRATION`: `sampled` or `reported` (default: sampled)
    /// - `PROBE_INITIAL_ITERATIONS`: first batch size (default: 1)
    /// - `PROBE_OUTPUT_DIR`: directory for JSON results
    /// - `PROBE_WARM`: untimed warm-up call before each measurement (default: false)
    /// - `PROBE_VERBOSE`: print result tables (default: true)
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        parse_into(&lookup, "PROBE_TOLERANCE", &mut cfg.error_tolerance);
        parse_into(&lookup, "PROBE_THREADS", &mut cfg.threads);
        parse_into(&lookup, "PROBE_GRID", &mut cfg.grid);
        parse_into(&lookup, "PROBE_BLOCK", &mut cfg.block);
        parse_into(&lookup, "PROBE_CALIBRATION", &mut cfg.calibration);
        parse_into(&lookup, "PROBE_INITIAL_ITERATIONS", &mut cfg.initial_iterations);
        if let Some(v) = lookup("PROBE_OUTPUT_DIR") {
            cfg.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("PROBE_WARM") {
            cfg.warm = is_truthy(&v);
        }
        if let Some(v) = lookup("PROBE_VERBOSE") {
            cfg.verbose = is_truthy(&v);
        }

        cfg
    }

    /// Set the relative error bound.
    pub fn tolerance(mut self, e: f64) -> Self {
        self.error_tolerance = e;
        self
    }

    /// Set the worker thread count.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    /// Set the matrix shape in blocks.
    pub fn grid(mut self, grid: usize, block: usize) -> Self {
        self.grid = grid;
        self.block = block;
        self
    }

    /// Set the calibration method.
    pub fn calibration(mut self, method: CalibrationMethod) -> Self {
        self.calibration = method;
        self
    }

    /// Set the first batch size.
    pub fn initial_iterations(mut self, n: u64) -> Self {
        self.initial_iterations = n;
        self
    }

    /// Write JSON results into `path`.
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Warm each op up before measuring it.
    pub fn warm(mut self, warm: bool) -> Self {
        self.warm = warm;
        self
    }

    /// Set verbose output.
    pub fn verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    /// Matrix shape described by `grid` and `block`.
    pub fn layout(&self) -> Result<BlockLayout> {
        BlockLayout::new(self.grid, self.block)
    }

    /// Reject timing settings. Every suite times through these.
    pub fn validate(&self) -> Result<()> {
        validate_tolerance(self.error_tolerance)?;
        if self.initial_iterations == 0 {
            return Err(invalid_config("initial iteration count must be positive"));
        }
        Ok(())
    }

    /// Reject the matrix settings; only the matmul suite reads them.
    pub fn validate_matmul(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(invalid_config("thread count must be positive"));
        }
        self.layout()?;
        Ok(())
    }
}

fn is_truthy(v: &str) -> bool {
    v != "0" && !v.eq_ignore_ascii_case("false")
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(v) = lookup(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!("ignoring {key}={v:?}: not a valid value"),
        }
    }
}
