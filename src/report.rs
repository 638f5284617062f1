//! Pluggable reporters for probe output.
//!
//! Reporters never panic and never fail a run: write errors are logged and
//! swallowed.

use crate::clock::Delta;
use crate::config::ProbeConfig;
use crate::result::{ProbeResult, SuiteResult};
use log::{info, warn};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Trait for probe result reporters.
pub trait Reporter: Send + Sync {
    /// Called once the clock is calibrated, before any probe runs.
    fn suite_start(&self, _suite: &str, _config: &ProbeConfig, _delta: Delta) {}

    /// Called when a probe row is recorded.
    fn probe_end(&self, _result: &ProbeResult) {}

    /// Called when a suite completes.
    fn suite_end(&self, _result: &SuiteResult) {}
}

const NAME_WIDTH: usize = 28;
const ITERS_WIDTH: usize = 10;
const DURATION_WIDTH: usize = 12;
const THROUGHPUT_WIDTH: usize = 16;
const RULE: &str = "--------------------------------------------------------------------------------------------";

/// Console reporter that prints a results table to stdout.
///
/// Each row is written as one complete line so concurrent output cannot
/// interleave within a row.
pub struct ConsoleReporter {
    output_lock: Mutex<()>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            output_lock: Mutex::new(()),
        }
    }

    /// Column headings matching [`format_row`](Self::format_row).
    fn format_header() -> String {
        format!(
            "  {:<nw$} {:>iw$} {:>dw$} {:>tw$}  params",
            "probe",
            "iters",
            "per call",
            "throughput",
            nw = NAME_WIDTH,
            iw = ITERS_WIDTH,
            dw = DURATION_WIDTH,
            tw = THROUGHPUT_WIDTH
        )
    }

    fn format_row(result: &ProbeResult) -> String {
        let name = result.name.rsplit_once('/').map_or(result.name.as_str(), |(_, n)| n);
        let params: Vec<_> = result.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!(
            "  {:<nw$} {:>iw$} {:>dw$} {:>tw$}  {}",
            name,
            result.iterations,
            format_duration(result.per_call),
            format_throughput(result.throughput()),
            params.join(" "),
            nw = NAME_WIDTH,
            iw = ITERS_WIDTH,
            dw = DURATION_WIDTH,
            tw = THROUGHPUT_WIDTH
        )
        .trim_end()
        .to_string()
    }

    fn write_stdout(&self, message: &str) {
        let _guard = self.output_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{message}") {
            warn!("failed to write to stdout: {e}");
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn suite_start(&self, suite: &str, config: &ProbeConfig, delta: Delta) {
        let header = format!(
            "{RULE}\n\
             Probe Suite: {suite}\n\
             Clock delta: {delta} ({}), tolerance: {}\n\
             {RULE}\n\
             {}",
            config.calibration,
            config.error_tolerance,
            Self::format_header()
        );
        self.write_stdout(&header);
    }

    fn probe_end(&self, result: &ProbeResult) {
        self.write_stdout(&Self::format_row(result));
    }

    fn suite_end(&self, result: &SuiteResult) {
        let footer = format!(
            "{RULE}\n\
             Completed {} probes in {}\n\
             {RULE}",
            result.results.len(),
            format_duration(result.total_duration)
        );
        self.write_stdout(&footer);
    }
}

/// JSON reporter that writes `<output_dir>/<suite>.json` when the suite ends.
pub struct JsonReporter {
    output_dir: PathBuf,
}

impl JsonReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Path the suite's results are written to.
    pub fn path_for(&self, suite: &str) -> PathBuf {
        let sanitized = suite.replace(['/', '\\'], "_");
        self.output_dir.join(format!("{sanitized}.json"))
    }

    fn write_results(&self, result: &SuiteResult) -> crate::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.path_for(&result.suite);
        let json = serde_json::to_string_pretty(result)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

impl Reporter for JsonReporter {
    fn suite_end(&self, result: &SuiteResult) {
        match self.write_results(result) {
            Ok(path) => info!("results written to {}", path.display()),
            Err(e) => warn!("failed to write JSON results: {e}"),
        }
    }
}

/// Combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter {
    fn suite_start(&self, suite: &str, config: &ProbeConfig, delta: Delta) {
        for r in &self.reporters {
            r.suite_start(suite, config, delta);
        }
    }

    fn probe_end(&self, result: &ProbeResult) {
        for r in &self.reporters {
            r.probe_end(result);
        }
    }

    fn suite_end(&self, result: &SuiteResult) {
        for r in &self.reporters {
            r.suite_end(result);
        }
    }
}

/// Format a duration with two decimals in ns, us, ms or s.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.2}s", secs)
    } else if secs >= 0.001 {
        format!("{:.2}ms", secs * 1_000.0)
    } else if secs >= 0.000_001 {
        format!("{:.2}us", secs * 1_000_000.0)
    } else {
        format!("{:.2}ns", secs * 1_000_000_000.0)
    }
}

/// Format work units per second, or `-` when there is no throughput.
pub fn format_throughput(per_sec: Option<f64>) -> String {
    match per_sec {
        Some(v) if v >= 1_000_000_000.0 => format!("{:.2}G/s", v / 1_000_000_000.0),
        Some(v) if v >= 1_000_000.0 => format!("{:.2}M/s", v / 1_000_000.0),
        Some(v) if v >= 1_000.0 => format!("{:.2}K/s", v / 1_000.0),
        Some(v) => format!("{:.0}/s", v),
        None => "-".to_string(),
    }
}
