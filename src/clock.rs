//! Clock sampling and resolution calibration.
//!
//! Every measurement in this crate is bounded by `delta`, the smallest
//! increment the monotonic clock can distinguish. Two ways of obtaining it
//! are offered:
//!
//! - [`estimate_delta`] spins on the clock and averages the smallest observed
//!   steps. Slow (about a thousand clock ticks) but reflects what the timing
//!   loop will actually see.
//! - [`estimate_delta_hw`] asks the OS for the clock's advertised resolution.
//!   Instant, but the advertised value can be optimistic.

use crate::error::{ProbeError, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Number of clock steps averaged by [`estimate_delta`].
pub const SAMPLE_SIZE: usize = 1000;

/// Clock reads allowed per trial before the clock is declared stuck.
pub const MAX_SPINS_PER_TRIAL: u64 = 50_000_000;

/// A monotonic timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockSample(Instant);

impl ClockSample {
    /// Read the clock.
    #[inline]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Seconds elapsed from `start` to `self`, never negative.
    #[inline]
    pub fn elapsed_since(self, start: ClockSample) -> f64 {
        self.0.saturating_duration_since(start.0).as_secs_f64()
    }

    /// Same as [`elapsed_since`](Self::elapsed_since) but as a `Duration`.
    #[inline]
    pub fn duration_since(self, start: ClockSample) -> Duration {
        self.0.saturating_duration_since(start.0)
    }
}

/// The clock's minimum distinguishable duration, in seconds. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Delta(f64);

impl Delta {
    /// Wrap a resolution in seconds, rejecting zero, negative and non-finite values.
    pub fn from_secs(secs: f64) -> Result<Self> {
        if secs.is_finite() && secs > 0.0 {
            Ok(Self(secs))
        } else {
            Err(ProbeError::Calibration {
                reason: format!("clock resolution must be positive and finite, got {secs}"),
            })
        }
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs_f64(self.0)
    }
}

impl TryFrom<f64> for Delta {
    type Error = ProbeError;

    fn try_from(secs: f64) -> Result<Self> {
        Self::from_secs(secs)
    }
}

impl From<Delta> for f64 {
    fn from(delta: Delta) -> f64 {
        delta.0
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}ns", self.0 * 1e9)
    }
}

/// How `delta` is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    /// Spin on the clock and average the observed steps.
    #[default]
    Sampled,
    /// Use the resolution reported by the OS, falling back to sampling.
    Reported,
}

impl CalibrationMethod {
    /// Produce a `delta` using this method.
    pub fn calibrate(self) -> Result<Delta> {
        match self {
            CalibrationMethod::Sampled => estimate_delta(),
            CalibrationMethod::Reported => estimate_delta_hw(),
        }
    }
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationMethod::Sampled => f.write_str("sampled"),
            CalibrationMethod::Reported => f.write_str("reported"),
        }
    }
}

impl FromStr for CalibrationMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sampled" | "sample" => Ok(CalibrationMethod::Sampled),
            "reported" | "hw" | "hardware" => Ok(CalibrationMethod::Reported),
            other => Err(format!(
                "unknown calibration method '{other}' (expected 'sampled' or 'reported')"
            )),
        }
    }
}

/// Estimate `delta` by averaging [`SAMPLE_SIZE`] observed clock steps.
pub fn estimate_delta() -> Result<Delta> {
    estimate_delta_with(SAMPLE_SIZE, MAX_SPINS_PER_TRIAL)
}

pub(crate) fn estimate_delta_with(trials: usize, max_spins: u64) -> Result<Delta> {
    if trials == 0 {
        return Err(ProbeError::Calibration {
            reason: "at least one calibration trial is required".to_string(),
        });
    }

    let mut accum = 0.0;
    for trial in 0..trials {
        let start = ClockSample::now();
        let mut spins = 0u64;
        let end = loop {
            let now = ClockSample::now();
            if now > start {
                break now;
            }
            spins += 1;
            if spins >= max_spins {
                return Err(ProbeError::Calibration {
                    reason: format!(
                        "clock did not advance after {max_spins} reads (trial {trial} of {trials})"
                    ),
                });
            }
        };
        accum += end.elapsed_since(start);
    }

    let delta = Delta::from_secs(accum / trials as f64)?;
    debug!("sampled clock resolution over {trials} trials: {delta}");
    Ok(delta)
}

/// Use the resolution the OS reports for the monotonic clock.
///
/// Falls back to [`estimate_delta`] on platforms without `clock_getres` or
/// when the reported value is zero.
pub fn estimate_delta_hw() -> Result<Delta> {
    match reported_resolution() {
        Some(secs) => {
            let delta = Delta::from_secs(secs)?;
            debug!("reported clock resolution: {delta}");
            Ok(delta)
        }
        None => {
            debug!("clock resolution not reported, sampling instead");
            estimate_delta()
        }
    }
}

#[cfg(unix)]
fn reported_resolution() -> Option<f64> {
    let mut res = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_getres only writes into the timespec we own.
    let ret = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut res) };
    if ret != 0 {
        return None;
    }
    let secs = res.tv_sec as f64 + res.tv_nsec as f64 * 1e-9;
    (secs > 0.0).then_some(secs)
}

#[cfg(not(unix))]
fn reported_resolution() -> Option<f64> {
    None
}

/// Spin until at least `duration` has elapsed. Used as a fixed-cost workload.
pub fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_never_report_zero_when_sampling() {
        let delta = estimate_delta().unwrap();
        assert!(delta.as_secs() > 0.0);
        // Any usable monotonic clock resolves better than a millisecond.
        assert!(delta.as_secs() < 1e-3, "delta = {delta}");
    }

    #[test]
    fn should_report_positive_resolution_when_queried() {
        let delta = estimate_delta_hw().unwrap();
        assert!(delta.as_secs() > 0.0);
    }

    #[test]
    fn should_reject_zero_and_nan_resolution() {
        assert!(Delta::from_secs(0.0).is_err());
        assert!(Delta::from_secs(-1e-9).is_err());
        assert!(Delta::from_secs(f64::NAN).is_err());
        assert!(Delta::from_secs(f64::INFINITY).is_err());
        assert!(Delta::from_secs(1e-9).is_ok());
    }

    #[test]
    fn should_fail_calibration_when_no_trials_requested() {
        assert!(matches!(
            estimate_delta_with(0, 10),
            Err(ProbeError::Calibration { .. })
        ));
    }

    #[test]
    fn should_order_samples_causally() {
        let start = ClockSample::now();
        spin_for(Duration::from_micros(50));
        let end = ClockSample::now();
        assert!(end >= start);
        assert!(end.elapsed_since(start) >= 50e-6);
        // Reversed order saturates instead of going negative.
        assert_eq!(start.elapsed_since(end), 0.0);
    }

    #[test]
    fn should_parse_calibration_method_names() {
        assert_eq!("sampled".parse(), Ok(CalibrationMethod::Sampled));
        assert_eq!("HW".parse(), Ok(CalibrationMethod::Reported));
        assert!("bogus".parse::<CalibrationMethod>().is_err());
    }

    #[test]
    fn should_round_trip_delta_through_json() {
        let delta = Delta::from_secs(2.5e-8).unwrap();
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(serde_json::from_str::<Delta>(&json).unwrap(), delta);
        assert!(serde_json::from_str::<Delta>("0.0").is_err());
    }
}
