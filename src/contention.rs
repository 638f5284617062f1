//! Lock contention probe.
//!
//! Many threads bump one shared counter, either under a mutex or with an
//! atomic add. Comparing the two exposes the cost of lock handoff.

use crate::error::{invalid_config, ProbeError, Result};
use crate::pool::run_workers;
use crate::result::{ProbeKind, ProbeResult};
use crate::runner::ProbeRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Increments shared across all workers of one run.
pub const DEFAULT_TOTAL_INCREMENTS: u64 = 1 << 20;

/// How the shared counter is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionMode {
    /// Each increment takes and releases a mutex.
    Lock,
    /// Each increment is a single atomic `fetch_add`.
    Atomic,
}

impl ContentionMode {
    pub const ALL: [ContentionMode; 2] = [ContentionMode::Lock, ContentionMode::Atomic];
}

impl fmt::Display for ContentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentionMode::Lock => f.write_str("lock"),
            ContentionMode::Atomic => f.write_str("atomic"),
        }
    }
}

impl FromStr for ContentionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lock" | "mutex" | "sem" => Ok(ContentionMode::Lock),
            "atomic" => Ok(ContentionMode::Atomic),
            other => Err(format!("unknown contention mode '{other}' (expected 'lock' or 'atomic')")),
        }
    }
}

/// Spread `total_increments` over `threads` workers and return the final count.
///
/// Each worker performs `total_increments / threads` increments; the count
/// must come out to exactly `threads` times that, or a lost update occurred.
pub fn count_with(mode: ContentionMode, threads: usize, total_increments: u64) -> Result<u64> {
    if threads == 0 {
        return Err(invalid_config("thread count must be positive"));
    }
    let per_thread = total_increments / threads as u64;
    if per_thread == 0 {
        return Err(invalid_config(format!(
            "{total_increments} increments cannot be split across {threads} threads"
        )));
    }

    let count = match mode {
        ContentionMode::Lock => {
            let counter = Mutex::new(0u64);
            run_workers("contention", threads, |_| {
                for _ in 0..per_thread {
                    *counter.lock().unwrap_or_else(|e| e.into_inner()) += 1;
                }
            })?;
            counter.into_inner().unwrap_or_else(|e| e.into_inner())
        }
        ContentionMode::Atomic => {
            let counter = AtomicU64::new(0);
            run_workers("contention", threads, |_| {
                for _ in 0..per_thread {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })?;
            counter.into_inner()
        }
    };

    let expected = per_thread * threads as u64;
    if count != expected {
        return Err(ProbeError::Mismatch {
            location: format!("{mode} counter"),
            expected,
            actual: count,
        });
    }
    Ok(count)
}

/// Time one full contention run per call and record it on `runner`.
pub fn probe(
    runner: &mut ProbeRunner,
    mode: ContentionMode,
    threads: usize,
    total_increments: u64,
) -> Result<ProbeResult> {
    // Untimed warm-up run; also rejects bad arguments before calibration.
    let increments = count_with(mode, threads, total_increments)?;

    let mut failure = None;
    let timing = runner.timer().time(
        || {
            if failure.is_none() {
                if let Err(e) = count_with(mode, threads, total_increments) {
                    failure = Some(e);
                }
            }
        },
        runner.tolerance(),
    )?;
    if let Some(e) = failure {
        return Err(e);
    }

    let result = ProbeResult::from_timing(format!("{mode}[t={threads}]"), ProbeKind::Contention, &timing)
        .with_work_units(increments)
        .with_tag("mode", mode)
        .with_tag("threads", threads);
    Ok(runner.record(result).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_lose_no_updates_in_either_mode() {
        for mode in ContentionMode::ALL {
            for threads in [1, 2, 7, 16] {
                let count = count_with(mode, threads, 1 << 14).unwrap();
                assert_eq!(count, (1 << 14) / threads as u64 * threads as u64, "{mode} {threads}");
            }
        }
    }

    #[test]
    fn should_reject_more_threads_than_increments() {
        assert!(count_with(ContentionMode::Atomic, 8, 4).is_err());
        assert!(count_with(ContentionMode::Lock, 0, 4).is_err());
    }

    #[test]
    fn should_parse_mode_aliases() {
        assert_eq!("mutex".parse(), Ok(ContentionMode::Lock));
        assert_eq!("sem".parse(), Ok(ContentionMode::Lock));
        assert_eq!("ATOMIC".parse(), Ok(ContentionMode::Atomic));
        assert!("spin".parse::<ContentionMode>().is_err());
    }
}
