//! Simultaneous multithreading probe.
//!
//! Every worker is pinned to the same core and increments its own array.
//! With one hardware thread per core the time grows linearly in the number
//! of workers; a core with SMT absorbs the second worker almost for free.

use crate::error::{invalid_config, ProbeError, Result};
use crate::pool::run_workers;
use crate::result::{ProbeKind, ProbeResult};
use crate::runner::ProbeRunner;
use log::warn;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Elements each worker increments per run.
pub const WORKSIZE: usize = 1 << 16;
/// Largest worker count swept by the CLI.
pub const DEFAULT_MAX_THREADS: usize = 9;

/// One private array per worker.
#[derive(Debug)]
pub struct WorkArrays {
    rows: Vec<Box<[AtomicU32]>>,
}

impl WorkArrays {
    pub fn new(workers: usize) -> Self {
        let rows = (0..workers)
            .map(|_| (0..WORKSIZE).map(|_| AtomicU32::new(0)).collect())
            .collect();
        Self { rows }
    }

    pub fn workers(&self) -> usize {
        self.rows.len()
    }

    /// Sum of all elements of worker `worker`'s array.
    pub fn total(&self, worker: usize) -> u64 {
        self.rows[worker]
            .iter()
            .map(|x| u64::from(x.load(Ordering::Relaxed)))
            .sum()
    }

    /// Run `threads` workers, each incrementing every element of its own
    /// array once. With `core` set every worker first pins itself there.
    pub fn run_pinned(&self, threads: usize, core: Option<usize>) -> Result<()> {
        if threads > self.workers() {
            return Err(invalid_config(format!(
                "{threads} workers need {threads} arrays, only {} allocated",
                self.workers()
            )));
        }

        let pin_failure: Mutex<Option<ProbeError>> = Mutex::new(None);
        run_workers("smt", threads, |worker| {
            if let Some(core) = core {
                if let Err(source) = pin_current_thread(core) {
                    let mut slot = pin_failure.lock().unwrap_or_else(|e| e.into_inner());
                    if slot.is_none() {
                        *slot = Some(ProbeError::Affinity { worker, core, source });
                    }
                    return;
                }
            }
            // Plain load/store: each array has a single writer.
            for x in self.rows[worker].iter() {
                x.store(x.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
            }
        })?;

        match pin_failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Lowest-numbered CPU this process may run on, if affinity is supported.
#[cfg(target_os = "linux")]
pub fn first_allowed_cpu() -> Option<usize> {
    // SAFETY: cpu_set_t is a plain bitmask; sched_getaffinity writes at most
    // size_of::<cpu_set_t>() bytes into the set we own.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return None;
        }
        (0..libc::CPU_SETSIZE as usize).find(|&cpu| libc::CPU_ISSET(cpu, &set))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn first_allowed_cpu() -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn pin_current_thread(core: usize) -> io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core {core} exceeds the affinity mask"),
        ));
    }
    // SAFETY: as above; CPU_ZERO/CPU_SET only touch the set we own and
    // `core` is within its bounds.
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_core: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity is not supported on this platform",
    ))
}

/// Time `1..=max_threads` workers sharing one core and record one row each.
pub fn probe(runner: &mut ProbeRunner, max_threads: usize) -> Result<Vec<ProbeResult>> {
    let core = first_allowed_cpu();
    if core.is_none() {
        warn!("thread affinity unavailable; smt workers run unpinned");
    }
    let arrays = WorkArrays::new(max_threads);

    let mut rows = Vec::new();
    for threads in 1..=max_threads {
        arrays.run_pinned(threads, core)?;

        let mut failure = None;
        let timing = runner.timer().time(
            || {
                if failure.is_none() {
                    if let Err(e) = arrays.run_pinned(threads, core) {
                        failure = Some(e);
                    }
                }
            },
            runner.tolerance(),
        )?;
        if let Some(e) = failure {
            return Err(e);
        }

        let result = ProbeResult::from_timing(format!("smt[t={threads}]"), ProbeKind::Smt, &timing)
            .with_work_units((threads * WORKSIZE) as u64)
            .with_tag("threads", threads)
            .with_tag("core", core.map_or_else(|| "any".to_string(), |c| c.to_string()));
        rows.push(runner.record(result).clone());
    }
    Ok(rows)
}
