//! Thread scaling probe.
//!
//! Runs a fixed busy loop on `n` threads at once (the caller plus `n - 1`
//! spawned workers). On an idle machine the wall time stays flat until `n`
//! exceeds the number of hardware threads, then grows linearly.

use crate::clock::ClockSample;
use crate::error::Result;
use crate::pool::run_workers_with_caller;
use crate::result::{ProbeKind, ProbeResult};
use crate::runner::ProbeRunner;
use std::hint::black_box;
use std::time::Duration;

/// Busy-loop iterations per thread used by the CLI.
pub const DEFAULT_WORK: u64 = 1 << 26;

/// Count to `iterations` without letting the compiler fold the loop.
pub fn busy_work(iterations: u64) -> u64 {
    let mut x = 0u64;
    for _ in 0..iterations {
        x = black_box(x.wrapping_add(1));
    }
    x
}

/// Wall time for `threads` threads to each finish `work` iterations.
pub fn scaling_experiment(threads: usize, work: u64) -> Result<Duration> {
    let start = ClockSample::now();
    run_workers_with_caller("scaling", threads, |_| {
        black_box(busy_work(work));
    })?;
    Ok(ClockSample::now().duration_since(start))
}

/// Measure every thread count in `1..=max_threads` and record one row each.
pub fn probe(runner: &mut ProbeRunner, max_threads: usize, work: u64) -> Result<Vec<ProbeResult>> {
    (1..=max_threads)
        .map(|n| {
            let elapsed = scaling_experiment(n, work)?;
            let result = ProbeResult::from_elapsed(format!("scaling[t={n}]"), ProbeKind::Scaling, elapsed)
                .with_work_units(work * n as u64)
                .with_tag("threads", n);
            Ok(runner.record(result).clone())
        })
        .collect()
}
