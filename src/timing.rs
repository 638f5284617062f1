//! Adaptive timing harness.
//!
//! Times a zero-argument operation to within a requested relative error by
//! running it in batches of doubling size until the batch takes long enough,
//! relative to the clock's resolution, for the error bound to hold.
//!
//! The absolute error of one measurement is at most `delta`, so an aggregate
//! of `delta + delta / E` seconds keeps the relative error below `E`.

use crate::clock::{CalibrationMethod, ClockSample, Delta};
use crate::error::{invalid_config, ProbeError, Result};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::time::Duration;

/// Outcome of one adaptive measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingResult {
    /// Estimated seconds per call (`aggregate / iterations`).
    pub per_call: f64,
    /// Calls in the batch that met the threshold.
    pub iterations: u64,
    /// Batches timed, including the final one.
    pub rounds: u32,
    /// Seconds taken by the final batch.
    pub aggregate: f64,
    /// Minimum aggregate time that had to be observed.
    pub threshold: f64,
}

impl TimingResult {
    pub fn per_call_duration(&self) -> Duration {
        Duration::from_secs_f64(self.per_call)
    }

    /// Calls per second implied by the estimate.
    pub fn calls_per_sec(&self) -> f64 {
        1.0 / self.per_call
    }
}

/// Minimum aggregate time that bounds the relative error by `error_tolerance`.
pub fn minimum_observed_time(error_tolerance: f64, delta: Delta) -> f64 {
    let delta = delta.as_secs();
    delta + delta / error_tolerance
}

/// Reject tolerances outside the open interval (0, 1).
pub fn validate_tolerance(error_tolerance: f64) -> Result<()> {
    if error_tolerance > 0.0 && error_tolerance < 1.0 {
        Ok(())
    } else {
        Err(invalid_config(format!(
            "error tolerance must lie strictly between 0 and 1, got {error_tolerance}"
        )))
    }
}

/// Wall-clock seconds taken by `n` back-to-back calls of `op`.
///
/// Every call goes through `black_box`, so an op whose work the optimizer
/// could prove dead still costs one opaque call per iteration.
pub fn time_for_n_iterations<F>(op: &mut F, n: u64) -> f64
where
    F: FnMut(),
{
    let start = ClockSample::now();
    for i in 0..n {
        black_box(i);
        (black_box(&mut *op))();
    }
    ClockSample::now().elapsed_since(start)
}

/// A calibrated timer.
///
/// Holds `delta` so repeated measurements do not pay for calibration each time.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    delta: Delta,
    initial_iterations: u64,
    warm: bool,
}

impl Timer {
    /// Calibrate the clock with `method` and build a timer around the result.
    pub fn calibrate(method: CalibrationMethod) -> Result<Self> {
        let delta = method.calibrate()?;
        debug!("timer calibrated ({method}): delta = {delta}");
        Ok(Self::with_delta(delta))
    }

    /// Build a timer around a known resolution.
    pub fn with_delta(delta: Delta) -> Self {
        Self {
            delta,
            initial_iterations: 1,
            warm: false,
        }
    }

    /// Batch size of the first round. Values below 1 are treated as 1.
    pub fn initial_iterations(mut self, n: u64) -> Self {
        self.initial_iterations = n.max(1);
        self
    }

    /// Call the op once, untimed, before every measurement.
    pub fn warm(mut self, warm: bool) -> Self {
        self.warm = warm;
        self
    }

    pub fn is_warm(&self) -> bool {
        self.warm
    }

    pub fn delta(&self) -> Delta {
        self.delta
    }

    /// Time `op`, doubling the batch size until the error bound holds.
    ///
    /// If a single batch already exceeds the threshold the result is
    /// returned after one round. Fails with [`ProbeError::NoConvergence`]
    /// once the batch size can no longer double.
    pub fn time<F>(&self, mut op: F, error_tolerance: f64) -> Result<TimingResult>
    where
        F: FnMut(),
    {
        validate_tolerance(error_tolerance)?;
        if self.warm {
            op();
        }
        let threshold = minimum_observed_time(error_tolerance, self.delta).max(self.delta.as_secs());
        self.converge(threshold, |n| time_for_n_iterations(&mut op, n))
    }

    /// Like [`time`](Self::time), but calls `op` once first to warm caches.
    pub fn time_warm<F>(&self, op: F, error_tolerance: f64) -> Result<TimingResult>
    where
        F: FnMut(),
    {
        self.warm(true).time(op, error_tolerance)
    }

    /// The doubling loop, with `measure(n)` returning the seconds taken by `n` calls.
    fn converge<M>(&self, threshold: f64, mut measure: M) -> Result<TimingResult>
    where
        M: FnMut(u64) -> f64,
    {
        let mut n = self.initial_iterations;
        let mut rounds = 1u32;

        loop {
            let aggregate = measure(n);
            trace!("round {rounds}: {n} iterations took {aggregate:.3e}s (need {threshold:.3e}s)");

            if aggregate >= threshold {
                return Ok(TimingResult {
                    per_call: aggregate / n as f64,
                    iterations: n,
                    rounds,
                    aggregate,
                    threshold,
                });
            }

            n = n.checked_mul(2).ok_or(ProbeError::NoConvergence {
                iterations: n,
                aggregate,
                threshold,
            })?;
            rounds += 1;
        }
    }
}

/// Calibrate the clock, then time `op` to within `error_tolerance`.
///
/// Calibration runs on every call; hold a [`Timer`] to amortize it.
pub fn time_operation<F>(op: F, error_tolerance: f64) -> Result<TimingResult>
where
    F: FnMut(),
{
    validate_tolerance(error_tolerance)?;
    Timer::calibrate(CalibrationMethod::Sampled)?.time(op, error_tolerance)
}
