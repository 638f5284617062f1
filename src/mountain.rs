//! Memory mountain.
//!
//! Read throughput of a strided walk over working sets from a few KiB up to
//! main-memory sizes. Plotted as stride × size, the ridges mark where the
//! working set stops fitting each cache level and the slopes show how much
//! spatial locality the hardware prefetcher recovers.

use crate::error::{invalid_config, Result};
use crate::result::{ProbeKind, ProbeResult};
use crate::runner::ProbeRunner;
use crate::timing::{Timer, TimingResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::mem::size_of;

pub const STRIDE_MIN: usize = 1;
/// Largest stride, in elements.
pub const STRIDE_MAX: usize = 32;
/// Smallest working set is `2^LOGSIZE_MIN` bytes.
pub const LOGSIZE_MIN: u32 = 10;
/// Largest working set the sweep accepts, `2^LOGSIZE_MAX` bytes.
pub const LOGSIZE_MAX: u32 = 30;
/// Largest working set swept by default (64 MiB).
pub const DEFAULT_LOGSIZE_MAX: u32 = 26;
/// Every point starts its doubling loop at this many reads.
pub const MIN_REPEAT: u64 = 512;
/// Bytes streamed through the caches before each point.
pub const PURGE_SIZE: usize = 1 << 22;

const ELEMENT_BYTES: usize = size_of::<f64>();

/// Which working-set sizes and strides to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountainSweep {
    min_log_size: u32,
    max_log_size: u32,
    max_stride: usize,
}

impl MountainSweep {
    pub fn new(min_log_size: u32, max_log_size: u32, max_stride: usize) -> Result<Self> {
        let smallest = ELEMENT_BYTES.trailing_zeros();
        if min_log_size < smallest || min_log_size > max_log_size || max_log_size > LOGSIZE_MAX {
            return Err(invalid_config(format!(
                "log2 sizes must satisfy {smallest} <= min <= max <= {LOGSIZE_MAX}, got {min_log_size}..={max_log_size}"
            )));
        }
        if max_stride < STRIDE_MIN {
            return Err(invalid_config("stride must be at least 1"));
        }
        Ok(Self {
            min_log_size,
            max_log_size,
            max_stride,
        })
    }

    pub fn max_log_size(&self) -> u32 {
        self.max_log_size
    }

    /// `(log2 size, stride)` pairs, largest working set first.
    pub fn points(&self) -> impl Iterator<Item = (u32, usize)> {
        let strides = STRIDE_MIN..=self.max_stride;
        (self.min_log_size..=self.max_log_size)
            .rev()
            .flat_map(move |log| strides.clone().map(move |stride| (log, stride)))
    }
}

impl Default for MountainSweep {
    fn default() -> Self {
        Self {
            min_log_size: LOGSIZE_MIN,
            max_log_size: DEFAULT_LOGSIZE_MAX,
            max_stride: STRIDE_MAX,
        }
    }
}

/// Sum every `stride`-th element of `data`.
pub fn strided_sum(data: &[f64], stride: usize) -> f64 {
    data.iter().step_by(stride).sum()
}

/// Bytes loaded by one [`strided_sum`] over `len` elements.
pub fn bytes_read(len: usize, stride: usize) -> u64 {
    (len.div_ceil(stride) * ELEMENT_BYTES) as u64
}

/// Stream a buffer larger than the last-level cache through it.
struct CachePurger(Vec<f64>);

impl CachePurger {
    fn new() -> Self {
        Self(vec![1.0; PURGE_SIZE / ELEMENT_BYTES])
    }

    fn purge(&self) {
        black_box(strided_sum(black_box(&self.0), 1));
    }
}

/// Time one strided walk over `data` with the adaptive harness.
pub fn read_time(timer: &Timer, tolerance: f64, data: &[f64], stride: usize) -> Result<TimingResult> {
    if stride == 0 {
        return Err(invalid_config("stride must be at least 1"));
    }
    timer.initial_iterations(MIN_REPEAT).time(
        || {
            black_box(strided_sum(black_box(data), stride));
        },
        tolerance,
    )
}

/// Sweep every point of `sweep` and record one row each.
pub fn probe(runner: &mut ProbeRunner, sweep: MountainSweep) -> Result<Vec<ProbeResult>> {
    let len = (1usize << sweep.max_log_size) / ELEMENT_BYTES;
    let data: Vec<f64> = (0..len).map(|i| i as f64).collect();
    let purger = CachePurger::new();
    let timer = runner.timer();

    let mut rows = Vec::new();
    for (log, stride) in sweep.points() {
        let size = 1usize << log;
        let slice = &data[..size / ELEMENT_BYTES];

        purger.purge();
        let timing = read_time(&timer, runner.tolerance(), slice, stride)?;

        let bytes = bytes_read(slice.len(), stride);
        let mb_per_sec = bytes as f64 / timing.per_call / (1024.0 * 1024.0);
        debug!("mountain size=2^{log} stride={stride}: {mb_per_sec:.1} MB/s");

        let result = ProbeResult::from_timing(format!("mountain[log={log},s={stride}]"), ProbeKind::Mountain, &timing)
            .with_work_units(bytes)
            .with_tag("size", size)
            .with_tag("stride", stride)
            .with_tag("mb_per_sec", format!("{mb_per_sec:.1}"));
        rows.push(runner.record(result).clone());
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Delta;
    use crate::config::ProbeConfig;

    #[test]
    fn should_visit_largest_size_first_then_every_stride() {
        let sweep = MountainSweep::new(10, 11, 3).unwrap();
        let points: Vec<_> = sweep.points().collect();
        assert_eq!(points, vec![(11, 1), (11, 2), (11, 3), (10, 1), (10, 2), (10, 3)]);
    }

    #[test]
    fn should_default_to_full_stride_range() {
        let sweep = MountainSweep::default();
        assert_eq!(sweep.points().count(), 17 * 32);
    }

    #[test]
    fn should_reject_sizes_outside_supported_range() {
        assert!(MountainSweep::new(2, 10, 4).is_err());
        assert!(MountainSweep::new(12, 10, 4).is_err());
        assert!(MountainSweep::new(10, LOGSIZE_MAX + 1, 4).is_err());
        assert!(MountainSweep::new(10, 12, 0).is_err());
    }

    #[test]
    fn should_sum_every_strided_element() {
        let data: Vec<f64> = (0..10).map(|i| i as f64).collect();
        assert_eq!(strided_sum(&data, 1), 45.0);
        assert_eq!(strided_sum(&data, 3), 0.0 + 3.0 + 6.0 + 9.0);
        assert_eq!(bytes_read(10, 3), 32);
    }

    #[test]
    fn should_start_from_min_repeat_reads() {
        let timer = Timer::with_delta(Delta::from_secs(1e-6).unwrap());
        let data = vec![1.0; 128];
        let timing = read_time(&timer, 0.5, &data, 2).unwrap();
        assert!(timing.iterations >= MIN_REPEAT);
        assert_eq!(timing.iterations % MIN_REPEAT, 0);
    }

    #[test]
    fn should_record_row_with_throughput_for_every_point() {
        let config = ProbeConfig::new().tolerance(0.1).verbose(false);
        let mut runner = ProbeRunner::new("mountain", config).unwrap();
        let sweep = MountainSweep::new(10, 12, 4).unwrap();

        let rows = probe(&mut runner, sweep).unwrap();

        assert_eq!(rows.len(), 3 * 4);
        assert_eq!(rows[0].name, "mountain/mountain[log=12,s=1]");
        assert_eq!(rows[0].work_units, Some(4096));
        assert_eq!(rows[0].tags.get("size").map(String::as_str), Some("4096"));
        assert!(rows.iter().all(|r| r.throughput().unwrap_or(0.0) > 0.0));
        assert!(rows.iter().all(|r| r.iterations >= MIN_REPEAT));
    }
}
