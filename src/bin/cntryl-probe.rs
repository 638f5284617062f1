//! cntryl-probe: run hardware and concurrency microbenchmarks from the shell.
//!
//! Every subcommand shares one calibrated clock and one error tolerance.
//! Results are printed as a table on stdout and, with `--json <dir>`,
//! written to `<dir>/<suite>.json`. Diagnostics go to stderr.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use cntryl_probe::{
    contention, estimate_delta, estimate_delta_hw, linesize, matmul, mountain, scaling, smt,
    BlockLayout, CalibrationMethod, ContentionMode, MountainSweep, ProbeConfig, ProbeKind,
    ProbeRunner,
};
use log::{info, LevelFilter, Metadata, Record};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "cntryl-probe",
    about = "Self-calibrating hardware and concurrency microbenchmarks",
    long_about = "
cntryl-probe measures clock resolution, parallel matrix-multiply throughput,
lock contention, thread scaling, SMT, cache line size and the memory
mountain. Every timing is taken with an adaptive harness that doubles the
batch size until the measurement error is below --tolerance.

Example:
    cntryl-probe delta                          # Clock resolution
    cntryl-probe matmul --threads 1,2,4,8,16    # Oversubscription sweep
    cntryl-probe matmul --dim 256 --block 32 --verify
    cntryl-probe contention --threads 8         # Mutex vs atomic
    cntryl-probe linesize                       # False-sharing sweep
    cntryl-probe mountain --max-log-size 24     # Memory mountain up to 16 MiB
    cntryl-probe smt                            # Workers sharing one core
"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Maximum relative error of each timing, between 0 and 1 (default: 0.01)
    #[arg(long, short = 'e', global = true)]
    tolerance: Option<f64>,

    /// How to obtain the clock resolution: sampled or reported
    #[arg(long, global = true)]
    calibration: Option<CalibrationMethod>,

    /// Batch size of the first timing round
    #[arg(long, global = true)]
    initial_iterations: Option<u64>,

    /// Directory for JSON results
    #[arg(long, global = true)]
    json: Option<PathBuf>,

    /// Call each operation once, untimed, before measuring it
    #[arg(long, global = true)]
    warm: bool,

    /// More diagnostics on stderr (repeat for trace output)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only errors on stderr, no result table
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Estimate the clock's resolution both ways
    Delta,

    /// Time a busy-wait of known cost to check the harness
    Spin {
        /// Cost of one call in microseconds
        #[arg(long, default_value_t = 1000)]
        micros: u64,
    },

    /// Block-scheduled parallel matrix multiply
    Matmul(MatmulArgs),

    /// Shared counter under a mutex versus an atomic add
    Contention {
        /// Worker threads
        #[arg(long, short = 't', default_value_t = 4)]
        threads: usize,

        /// Only run one mode (lock or atomic)
        #[arg(long)]
        mode: Option<ContentionMode>,

        /// Increments shared across all workers
        #[arg(long, default_value_t = contention::DEFAULT_TOTAL_INCREMENTS)]
        increments: u64,
    },

    /// Busy work on 1..=N threads
    Scaling {
        /// Largest thread count
        #[arg(long, default_value_t = 8)]
        max_threads: usize,

        /// Busy-loop iterations per thread
        #[arg(long, default_value_t = scaling::DEFAULT_WORK)]
        work: u64,
    },

    /// Two writers at increasing distances to find the cache line size
    Linesize {
        /// Increments per writer
        #[arg(long, default_value_t = linesize::DEFAULT_ITERATIONS)]
        iterations: u64,
    },

    /// Strided read throughput over growing working sets
    Mountain {
        /// log2 of the smallest working set in bytes
        #[arg(long, default_value_t = mountain::LOGSIZE_MIN)]
        min_log_size: u32,

        /// log2 of the largest working set in bytes
        #[arg(long, default_value_t = mountain::DEFAULT_LOGSIZE_MAX)]
        max_log_size: u32,

        /// Largest stride in elements
        #[arg(long, default_value_t = mountain::STRIDE_MAX)]
        max_stride: usize,
    },

    /// Workers pinned to one core, 1..=N
    Smt {
        /// Largest worker count
        #[arg(long, default_value_t = smt::DEFAULT_MAX_THREADS)]
        max_threads: usize,
    },
}

#[derive(Debug, Args)]
struct MatmulArgs {
    /// Worker thread counts to measure, comma separated (default: 10)
    #[arg(long, short = 't', value_delimiter = ',')]
    threads: Vec<usize>,

    /// Matrix width in blocks
    #[arg(long)]
    grid: Option<usize>,

    /// Block width in elements
    #[arg(long)]
    block: Option<usize>,

    /// Matrix width in elements; must be a multiple of --block (overrides --grid)
    #[arg(long)]
    dim: Option<usize>,

    /// Seed for the random input matrices
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Check each result against the sequential product
    #[arg(long)]
    verify: bool,
}

// ============================================================================
// Verbosity and Logging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Trace,
}

impl Verbosity {
    fn from_args(args: &GlobalArgs) -> Self {
        match (args.quiet, args.verbose) {
            (true, _) => Verbosity::Quiet,
            (false, 0) => Verbosity::Normal,
            (false, 1) => Verbosity::Verbose,
            (false, _) => Verbosity::Trace,
        }
    }

    fn level(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::Error,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Verbose => LevelFilter::Debug,
            Verbosity::Trace => LevelFilter::Trace,
        }
    }

    fn is_quiet(self) -> bool {
        self == Verbosity::Quiet
    }
}

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging(verbosity: Verbosity) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(verbosity.level());
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_args(&cli.global);
    init_logging(verbosity);

    let config = build_config(&cli.global, verbosity);

    match cli.cmd {
        Commands::Delta => run_delta(),
        Commands::Spin { micros } => run_spin(config, micros),
        Commands::Matmul(args) => run_matmul(config, args),
        Commands::Contention {
            threads,
            mode,
            increments,
        } => run_contention(config, threads, mode, increments),
        Commands::Scaling { max_threads, work } => run_scaling(config, max_threads, work),
        Commands::Linesize { iterations } => run_linesize(config, iterations),
        Commands::Mountain {
            min_log_size,
            max_log_size,
            max_stride,
        } => run_mountain(config, min_log_size, max_log_size, max_stride),
        Commands::Smt { max_threads } => run_smt(config, max_threads),
    }
}

/// Environment first, then command-line overrides.
fn build_config(args: &GlobalArgs, verbosity: Verbosity) -> ProbeConfig {
    let mut config = ProbeConfig::from_env();
    if let Some(e) = args.tolerance {
        config = config.tolerance(e);
    }
    if let Some(method) = args.calibration {
        config = config.calibration(method);
    }
    if let Some(n) = args.initial_iterations {
        config = config.initial_iterations(n);
    }
    if let Some(dir) = &args.json {
        config = config.output_dir(dir);
    }
    if args.warm {
        config = config.warm(true);
    }
    config.verbose(!verbosity.is_quiet())
}

fn runner(suite: &str, config: ProbeConfig) -> Result<ProbeRunner> {
    ProbeRunner::new(suite, config).context("Failed to start probe suite")
}

// ============================================================================
// Subcommands
// ============================================================================

fn run_delta() -> Result<()> {
    let sampled = estimate_delta().context("Sampled clock calibration failed")?;
    let reported = estimate_delta_hw().context("Reported clock calibration failed")?;

    println!("method    delta");
    println!("--------  ------------");
    println!("{:<8}  {}", CalibrationMethod::Sampled, sampled);
    println!("{:<8}  {}", CalibrationMethod::Reported, reported);
    Ok(())
}

fn run_spin(config: ProbeConfig, micros: u64) -> Result<()> {
    let cost = Duration::from_micros(micros);
    let mut runner = runner("spin", config)?;

    let result = runner
        .run(&format!("spin[{micros}us]"), ProbeKind::Timing, || {
            cntryl_probe::clock::spin_for(cost)
        })
        .context("Timing the busy-wait failed")?;

    let error = (result.per_call.as_secs_f64() - cost.as_secs_f64()) / cost.as_secs_f64();
    info!("relative error against nominal cost: {:+.4}", error);

    runner.finish();
    Ok(())
}

fn run_matmul(config: ProbeConfig, args: MatmulArgs) -> Result<()> {
    let block = args.block.unwrap_or(config.block);
    let grid = args.grid.unwrap_or(config.grid);
    let config = config.grid(grid, block);
    let layout = match args.dim {
        Some(dim) => BlockLayout::from_dimension(dim, block),
        None => config.layout(),
    }
    .context("Invalid matrix shape")?;

    let thread_counts = if args.threads.is_empty() {
        config.validate_matmul().context("Invalid matmul configuration")?;
        vec![config.threads]
    } else {
        args.threads
    };

    let mut runner = runner("matmul", config)?;
    for threads in thread_counts {
        matmul::probe(&mut runner, layout, threads, args.seed, args.verify)
            .with_context(|| format!("Matrix multiply on {threads} threads failed"))?;
    }
    runner.finish();
    Ok(())
}

fn run_contention(
    config: ProbeConfig,
    threads: usize,
    mode: Option<ContentionMode>,
    increments: u64,
) -> Result<()> {
    let modes = match mode {
        Some(m) => vec![m],
        None => ContentionMode::ALL.to_vec(),
    };

    let mut runner = runner("contention", config)?;
    for mode in modes {
        contention::probe(&mut runner, mode, threads, increments)
            .with_context(|| format!("Contention probe ({mode}, {threads} threads) failed"))?;
    }
    runner.finish();
    Ok(())
}

fn run_scaling(config: ProbeConfig, max_threads: usize, work: u64) -> Result<()> {
    let mut runner = runner("scaling", config)?;
    scaling::probe(&mut runner, max_threads, work).context("Thread scaling probe failed")?;
    runner.finish();
    Ok(())
}

fn run_linesize(config: ProbeConfig, iterations: u64) -> Result<()> {
    let mut runner = runner("linesize", config)?;
    linesize::probe(&mut runner, iterations).context("Cache line probe failed")?;
    runner.finish();
    Ok(())
}

fn run_mountain(config: ProbeConfig, min_log_size: u32, max_log_size: u32, max_stride: usize) -> Result<()> {
    let sweep = MountainSweep::new(min_log_size, max_log_size, max_stride).context("Invalid sweep")?;
    let mut runner = runner("mountain", config)?;
    mountain::probe(&mut runner, sweep).context("Memory mountain failed")?;
    runner.finish();
    Ok(())
}

fn run_smt(config: ProbeConfig, max_threads: usize) -> Result<()> {
    let mut runner = runner("smt", config)?;
    smt::probe(&mut runner, max_threads).context("SMT probe failed")?;
    runner.finish();
    Ok(())
}
