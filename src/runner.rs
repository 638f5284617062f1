//! The probe runner.

use crate::config::ProbeConfig;
use crate::error::Result;
use crate::report::{ConsoleReporter, JsonReporter, Reporter};
use crate::result::{ProbeKind, ProbeResult, SuiteResult};
use crate::timing::Timer;
use log::debug;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Runs probes against one calibrated clock and feeds the rows to reporters.
///
/// # Example
///
/// ```rust,no_run
/// use cntryl_probe::{ProbeConfig, ProbeKind, ProbeRunner};
///
/// let mut runner = ProbeRunner::new("my_suite", ProbeConfig::from_env())?;
///
/// let data: Vec<u64> = (0..1024).collect();
/// runner.run("sum_1k", ProbeKind::Timing, || {
///     std::hint::black_box(data.iter().sum::<u64>());
/// })?;
///
/// let suite = runner.finish();
/// # Ok::<(), cntryl_probe::ProbeError>(())
/// ```
pub struct ProbeRunner {
    suite: String,
    config: ProbeConfig,
    timer: Timer,
    results: Vec<ProbeResult>,
    suite_start: Instant,
    started_at: String,
    reporters: Vec<Box<dyn Reporter>>,
}

impl ProbeRunner {
    /// Validate the timing settings of `config`, calibrate the clock and
    /// announce the suite. Probe-specific settings are checked by the probes.
    ///
    /// Reporters: console when `verbose`, JSON when `output_dir` is set.
    pub fn new(suite: &str, config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        let timer = Timer::calibrate(config.calibration)?
            .initial_iterations(config.initial_iterations)
            .warm(config.warm);

        let mut reporters: Vec<Box<dyn Reporter>> = Vec::new();
        if config.verbose {
            reporters.push(Box::new(ConsoleReporter::new()));
        }
        if let Some(dir) = &config.output_dir {
            reporters.push(Box::new(JsonReporter::new(dir.clone())));
        }

        let runner = Self {
            suite: suite.to_string(),
            config,
            timer,
            results: Vec::new(),
            suite_start: Instant::now(),
            started_at: unix_millis(),
            reporters,
        };

        for r in &runner.reporters {
            r.suite_start(&runner.suite, &runner.config, runner.timer.delta());
        }

        Ok(runner)
    }

    /// Replace reporters with a custom set.
    pub fn reporters(&mut self, reporters: Vec<Box<dyn Reporter>>) -> &mut Self {
        self.reporters = reporters;
        self
    }

    /// Add an additional reporter.
    pub fn add_reporter(&mut self, reporter: Box<dyn Reporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The calibrated timer shared by every probe in the suite.
    pub fn timer(&self) -> Timer {
        self.timer
    }

    pub fn tolerance(&self) -> f64 {
        self.config.error_tolerance
    }

    /// Time `op` with the suite's tolerance and record the result.
    pub fn run<F>(&mut self, name: &str, kind: ProbeKind, op: F) -> Result<&ProbeResult>
    where
        F: FnMut(),
    {
        let timing = self.timer.time(op, self.config.error_tolerance)?;
        Ok(self.record(ProbeResult::from_timing(name, kind, &timing)))
    }

    /// Record a row measured elsewhere. The suite name is prefixed.
    pub fn record(&mut self, mut result: ProbeResult) -> &ProbeResult {
        result.name = format!("{}/{}", self.suite, result.name);
        debug!(
            "{}: {} iterations in {} rounds, {:?} per call",
            result.name, result.iterations, result.rounds, result.per_call
        );

        for r in &self.reporters {
            r.probe_end(&result);
        }

        self.results.push(result);
        &self.results[self.results.len() - 1]
    }

    pub fn results(&self) -> &[ProbeResult] {
        &self.results
    }

    /// Finish the suite, notify reporters and return the collected rows.
    pub fn finish(self) -> SuiteResult {
        let suite_result = SuiteResult {
            suite: self.suite,
            delta_secs: self.timer.delta().as_secs(),
            tolerance: self.config.error_tolerance,
            results: self.results,
            total_duration: self.suite_start.elapsed(),
            started_at: self.started_at,
        };

        for r in &self.reporters {
            r.suite_end(&suite_result);
        }

        suite_result
    }
}

fn unix_millis() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::spin_for;
    use std::time::Duration;

    fn quiet_runner() -> ProbeRunner {
        ProbeRunner::new("test", ProbeConfig::new().tolerance(0.1).verbose(false)).unwrap()
    }

    #[test]
    fn should_prefix_suite_name_when_recording() {
        let mut runner = quiet_runner();
        runner
            .run("spin", ProbeKind::Timing, || spin_for(Duration::from_micros(20)))
            .unwrap();

        let suite = runner.finish();
        assert_eq!(suite.results.len(), 1);
        assert_eq!(suite.results[0].name, "test/spin");
        assert!(suite.results[0].per_call >= Duration::from_micros(20));
        assert!(suite.delta_secs > 0.0);
    }

    #[test]
    fn should_reject_invalid_config_before_calibrating() {
        let err = ProbeRunner::new("test", ProbeConfig::new().tolerance(1.5)).err();
        assert!(matches!(err, Some(crate::ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn should_start_timing_suite_when_matrix_settings_unused() {
        let config = ProbeConfig::new().threads(0).tolerance(0.1).verbose(false);
        let mut runner = ProbeRunner::new("spin", config).unwrap();
        runner
            .run("spin", ProbeKind::Timing, || spin_for(Duration::from_micros(5)))
            .unwrap();
        assert_eq!(runner.results().len(), 1);
    }

    #[test]
    fn should_warm_every_timing_when_configured() {
        let config = ProbeConfig::new().tolerance(0.5).warm(true).verbose(false);
        let mut runner = ProbeRunner::new("warm", config).unwrap();
        assert!(runner.timer().is_warm());

        let mut calls = 0u64;
        let iterations = runner
            .run("spin", ProbeKind::Timing, || {
                calls += 1;
                spin_for(Duration::from_millis(2));
            })
            .unwrap()
            .iterations;
        assert_eq!(iterations, 1);
        assert_eq!(calls, 2);
    }

    #[test]
    fn should_keep_rows_in_recording_order() {
        let mut runner = quiet_runner();
        runner.record(ProbeResult::from_elapsed("a", ProbeKind::Scaling, Duration::from_millis(1)));
        runner.record(ProbeResult::from_elapsed("b", ProbeKind::Scaling, Duration::from_millis(2)));

        let names: Vec<_> = runner.results().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["test/a", "test/b"]);
    }

    #[test]
    fn should_write_json_when_output_dir_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProbeConfig::new().verbose(false).output_dir(dir.path());
        let mut runner = ProbeRunner::new("json_suite", config).unwrap();
        runner.record(ProbeResult::from_elapsed("x", ProbeKind::Timing, Duration::from_micros(5)));
        runner.finish();

        let loaded = SuiteResult::load(dir.path().join("json_suite.json")).unwrap();
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].name, "json_suite/x");
    }
}
