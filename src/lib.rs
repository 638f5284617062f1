//! # cntryl-probe
//!
//! Self-calibrating microbenchmarks for low-level hardware and concurrency
//! behavior: clock resolution, the memory hierarchy, cache line size, SMT,
//! lock contention and parallel numeric throughput.
//!
//! Two pieces do the real work:
//!
//! - an adaptive timing harness ([`Timer`], [`time_operation`]) that times a
//!   zero-argument operation to within a requested relative error, however
//!   coarse the clock, by doubling the batch size until the batch is long
//!   enough relative to the clock's resolution;
//! - a block-scheduled parallel multiply ([`SchedulingPass`]) whose workers
//!   claim tiles from a shared cursor ([`BlockScheduler`]) and accumulate
//!   into atomic output cells.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cntryl_probe::{time_operation, BlockLayout, Matrix, SchedulingPass, Timer, CalibrationMethod};
//!
//! // Time a closure to within 1%.
//! let data: Vec<u64> = (0..4096).collect();
//! let timing = time_operation(|| { std::hint::black_box(data.iter().sum::<u64>()); }, 0.01)?;
//! println!("{:?} per call after {} iterations", timing.per_call_duration(), timing.iterations);
//!
//! // Time a whole parallel multiply pass on 10 threads.
//! let layout = BlockLayout::new(4, 16)?;
//! let a = Matrix::seeded(layout.dim(), 1);
//! let b = Matrix::seeded(layout.dim(), 2);
//! let mut pass = SchedulingPass::new(layout, &a, &b)?;
//! let timer = Timer::calibrate(CalibrationMethod::Sampled)?;
//! let timing = cntryl_probe::matmul::time_pass(&timer, &mut pass, 10, 0.01)?;
//! # Ok::<(), cntryl_probe::ProbeError>(())
//! ```

pub mod clock;
mod config;
pub mod contention;
mod error;
pub mod linesize;
pub mod matmul;
pub mod mountain;
mod pool;
mod report;
mod result;
mod runner;
pub mod scaling;
pub mod schedule;
pub mod smt;
pub mod timing;

pub use clock::{estimate_delta, estimate_delta_hw, CalibrationMethod, ClockSample, Delta};
pub use config::ProbeConfig;
pub use contention::ContentionMode;
pub use error::{ProbeError, Result};
pub use matmul::{multiply_reference, parallel_multiply, AtomicMatrix, BlockLayout, Matrix, SchedulingPass};
pub use mountain::MountainSweep;
pub use report::{format_duration, ConsoleReporter, JsonReporter, MultiReporter, Reporter};
pub use result::{ProbeKind, ProbeResult, SuiteResult};
pub use runner::ProbeRunner;
pub use schedule::{BlockCoordinate, BlockScheduler};
pub use timing::{time_operation, Timer, TimingResult};
