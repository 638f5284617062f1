//! Cache-line size probe.
//!
//! Two threads hammer bytes `separation` apart in one buffer. While both
//! bytes share a cache line the line ping-pongs between cores and throughput
//! collapses; the smallest separation at which throughput recovers is the
//! line size.

use crate::clock::ClockSample;
use crate::error::{invalid_config, Result};
use crate::pool::run_workers;
use crate::result::{ProbeKind, ProbeResult};
use crate::runner::ProbeRunner;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Smallest separation swept by [`sweep_separations`].
pub const LINE_MIN: usize = 4;
/// Largest separation; the buffer holds `2 * LINE_MAX` bytes.
pub const LINE_MAX: usize = 1024;
/// Increments per thread used by the CLI.
pub const DEFAULT_ITERATIONS: u64 = 1 << 26;

// Page alignment so offset 0 starts a cache line.
#[repr(C, align(4096))]
struct AlignedBytes([AtomicU8; 2 * LINE_MAX]);

impl AlignedBytes {
    fn new() -> Box<Self> {
        Box::new(Self(std::array::from_fn(|_| AtomicU8::new(0))))
    }
}

/// Separations `LINE_MIN, 2*LINE_MIN, ..., LINE_MAX`.
pub fn sweep_separations() -> impl Iterator<Item = usize> {
    std::iter::successors(Some(LINE_MIN), |s| Some(s * 2)).take_while(|&s| s <= LINE_MAX)
}

/// Wall time for two threads to each increment their own byte `iterations` times.
pub fn false_sharing_experiment(separation: usize, iterations: u64) -> Result<Duration> {
    if separation == 0 || separation > LINE_MAX {
        return Err(invalid_config(format!(
            "separation must be in 1..={LINE_MAX}, got {separation}"
        )));
    }

    let bytes = AlignedBytes::new();
    let start = ClockSample::now();
    run_workers("linesize", 2, |worker| {
        let cell = &bytes.0[worker * separation];
        // Plain load/store, not an RMW: the writes must not be lock-prefixed.
        for _ in 0..iterations {
            cell.store(cell.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
        }
    })?;
    let elapsed = ClockSample::now().duration_since(start);

    let expected = (iterations % 256) as u8;
    debug_assert_eq!(bytes.0[0].load(Ordering::Relaxed), expected);
    Ok(elapsed)
}

/// Sweep all separations and record one row each.
pub fn probe(runner: &mut ProbeRunner, iterations: u64) -> Result<Vec<ProbeResult>> {
    sweep_separations()
        .map(|sep| {
            let elapsed = false_sharing_experiment(sep, iterations)?;
            let result = ProbeResult::from_elapsed(format!("linesize[sep={sep}]"), ProbeKind::LineSize, elapsed)
                .with_work_units(iterations)
                .with_tag("separation", sep);
            Ok(runner.record(result).clone())
        })
        .collect()
}
