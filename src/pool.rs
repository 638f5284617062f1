//! Scoped worker pools.

use crate::error::{invalid_config, ProbeError, Result};
use std::io;
use std::thread;

/// Run `work(worker_index)` on `threads` freshly spawned, named OS threads
/// and wait for all of them.
///
/// If any thread fails to spawn, the workers already started are joined and
/// the spawn error is returned; callers must discard whatever partial state
/// those workers produced.
pub(crate) fn run_workers<F>(label: &str, threads: usize, work: F) -> Result<()>
where
    F: Fn(usize) + Sync,
{
    run_workers_with(threads, 0, named(label), work)
}

/// Like [`run_workers`], but worker 0 runs on the calling thread once the
/// other `threads - 1` workers are spawned.
pub(crate) fn run_workers_with_caller<F>(label: &str, threads: usize, work: F) -> Result<()>
where
    F: Fn(usize) + Sync,
{
    run_workers_with(threads, 1, named(label), work)
}

/// Builder factory that names each worker `{label}-{index}`.
pub(crate) fn named(label: &str) -> impl Fn(usize) -> io::Result<thread::Builder> + '_ {
    move |worker| Ok(thread::Builder::new().name(format!("{label}-{worker}")))
}

/// Spawn workers `on_caller..threads` from `builder`, run workers
/// `0..on_caller` inline, then join.
pub(crate) fn run_workers_with<B, F>(
    threads: usize,
    on_caller: usize,
    builder: B,
    work: F,
) -> Result<()>
where
    B: Fn(usize) -> io::Result<thread::Builder>,
    F: Fn(usize) + Sync,
{
    if threads == 0 {
        return Err(invalid_config("worker thread count must be positive"));
    }

    let work = &work;
    let on_caller = on_caller.min(threads);
    thread::scope(|scope| -> Result<()> {
        for worker in on_caller..threads {
            builder(worker)
                .and_then(|b| b.spawn_scoped(scope, move || work(worker)))
                .map_err(|source| ProbeError::Spawn {
                    worker,
                    threads,
                    source,
                })?;
        }
        for worker in 0..on_caller {
            work(worker);
        }
        Ok(())
    })
}
