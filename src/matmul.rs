//! Block-scheduled parallel matrix multiply-accumulate.
//!
//! `C = A × B` over square `u64` matrices whose dimension is a whole number
//! of `block`-sized tiles. Workers claim tiles of `A` from a shared
//! [`BlockScheduler`] and add each tile's contribution into `C`. Different
//! tiles in the same row of `A` feed the same row of `C`, so every output
//! element is an [`AtomicU64`] and contributions land via `fetch_add`.
//! Arithmetic wraps, which keeps the result independent of the order in
//! which contributions arrive.

use crate::error::{invalid_config, ProbeError, Result};
use crate::pool::{named, run_workers_with};
use crate::result::{ProbeKind, ProbeResult};
use crate::runner::ProbeRunner;
use crate::schedule::{BlockCoordinate, BlockScheduler};
use crate::timing::{Timer, TimingResult};
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io;
use std::ops::Index;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Exclusive upper bound of randomly generated matrix elements.
pub const MAX_RANDOM_VALUE: u64 = 1 << 16;

/// Shape of a blocked matrix: `grid × grid` tiles of `block × block` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    grid: usize,
    block: usize,
}

impl BlockLayout {
    /// Rejects empty shapes and shapes whose element count, byte size or
    /// multiply-add count does not fit the platform's integers.
    pub fn new(grid: usize, block: usize) -> Result<Self> {
        if grid == 0 {
            return Err(invalid_config("matrix must span at least one block"));
        }
        if block == 0 {
            return Err(invalid_config("block size must be positive"));
        }
        let too_large = || invalid_config(format!("a {grid}×{grid} grid of {block}×{block} blocks is too large"));
        let dim = grid.checked_mul(block).ok_or_else(too_large)?;
        dim.checked_mul(dim)
            .and_then(|n| n.checked_mul(std::mem::size_of::<u64>()))
            .filter(|&bytes| bytes <= isize::MAX as usize)
            .ok_or_else(too_large)?;
        u64::try_from(dim)
            .ok()
            .and_then(|d| d.checked_pow(3))
            .ok_or_else(too_large)?;
        Ok(Self { grid, block })
    }

    /// Derive the grid from a matrix dimension, which must be a multiple of `block`.
    pub fn from_dimension(dim: usize, block: usize) -> Result<Self> {
        if block == 0 {
            return Err(invalid_config("block size must be positive"));
        }
        if dim == 0 || dim % block != 0 {
            return Err(invalid_config(format!(
                "matrix dimension {dim} is not a positive multiple of block size {block}"
            )));
        }
        Self::new(dim / block, block)
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    pub fn block(&self) -> usize {
        self.block
    }

    /// Matrix width and height in elements.
    pub fn dim(&self) -> usize {
        self.grid * self.block
    }

    /// Multiply-add operations in one full product. Fits by construction.
    pub fn multiply_adds(&self) -> u64 {
        (self.dim() as u64).pow(3)
    }
}

/// Dense, row-major square matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    dim: usize,
    data: Vec<u64>,
}

impl Matrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0; dim * dim],
        }
    }

    pub fn from_fn<F>(dim: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> u64,
    {
        let mut data = Vec::with_capacity(dim * dim);
        for r in 0..dim {
            for c in 0..dim {
                data.push(f(r, c));
            }
        }
        Self { dim, data }
    }

    /// Fill with values drawn uniformly from `0..MAX_RANDOM_VALUE`.
    pub fn random<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        Self::from_fn(dim, |_, _| rng.random_range(0..MAX_RANDOM_VALUE))
    }

    /// Deterministic random fill.
    pub fn seeded(dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::random(dim, &mut rng)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, r: usize) -> &[u64] {
        &self.data[r * self.dim..(r + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.data
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = u64;

    fn index(&self, (r, c): (usize, usize)) -> &u64 {
        &self.data[r * self.dim + c]
    }
}

/// Square matrix of atomic accumulators.
#[derive(Debug)]
pub struct AtomicMatrix {
    dim: usize,
    cells: Vec<AtomicU64>,
}

impl AtomicMatrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            cells: (0..dim * dim).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Atomically add `value` to element `(r, c)`, wrapping on overflow.
    #[inline]
    pub fn add(&self, r: usize, c: usize, value: u64) {
        // Relaxed: the pass's thread join orders these before any read.
        self.cells[r * self.dim + c].fetch_add(value, Ordering::Relaxed);
    }

    pub fn load(&self, r: usize, c: usize) -> u64 {
        self.cells[r * self.dim + c].load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for cell in &self.cells {
            cell.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Matrix {
        Matrix {
            dim: self.dim,
            data: self.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
        }
    }
}

/// State shared by the workers of one multiplication pass.
///
/// Borrows `A` and `B` for its lifetime; owns the cursor and `C`.
#[derive(Debug)]
pub struct SchedulingPass<'a> {
    layout: BlockLayout,
    a: &'a Matrix,
    b: &'a Matrix,
    c: AtomicMatrix,
    scheduler: BlockScheduler,
    complete: bool,
}

impl<'a> SchedulingPass<'a> {
    pub fn new(layout: BlockLayout, a: &'a Matrix, b: &'a Matrix) -> Result<Self> {
        let dim = layout.dim();
        if a.dim() != dim || b.dim() != dim {
            return Err(invalid_config(format!(
                "input matrices are {}×{} and {}×{}, layout needs {dim}×{dim}",
                a.dim(),
                a.dim(),
                b.dim(),
                b.dim()
            )));
        }
        Ok(Self {
            layout,
            a,
            b,
            c: AtomicMatrix::zeros(dim),
            scheduler: BlockScheduler::new(layout.grid())?,
            complete: false,
        })
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    /// Zero `C` and rewind the cursor.
    pub fn reset(&mut self) {
        self.c.clear();
        self.scheduler.reset();
        self.complete = false;
    }

    /// Run one full pass on `threads` workers.
    ///
    /// Starts from a reset state, so repeated runs produce identical output.
    /// A spawn failure abandons the pass; [`result`](Self::result) then
    /// refuses to hand out the partial matrix until a later run completes.
    pub fn run(&mut self, threads: usize) -> Result<()> {
        self.run_with(threads, named("matmul"))
    }

    /// [`run`](Self::run) with workers created by `builder`.
    pub(crate) fn run_with<B>(&mut self, threads: usize, builder: B) -> Result<()>
    where
        B: Fn(usize) -> io::Result<thread::Builder>,
    {
        self.reset();

        let this = &*self;
        let outcome = run_workers_with(threads, 0, builder, |worker| {
            let blocks = this.work();
            trace!("matmul worker {worker} processed {blocks} blocks");
        });

        self.complete = outcome.is_ok();
        outcome
    }

    /// Claim and compute blocks until the grid is exhausted.
    fn work(&self) -> usize {
        let mut blocks = 0;
        while let Some(coord) = self.scheduler.claim_block() {
            self.compute_block(coord);
            blocks += 1;
        }
        blocks
    }

    /// Add the contribution of tile `coord` of `A` into `C`.
    ///
    /// For each `(r, c)` in the tile and every output column `i`,
    /// `C[r][i] += A[r][c] * B[c][i]`.
    pub fn compute_block(&self, coord: BlockCoordinate) {
        let block = self.layout.block();
        let rows = coord.row * block..(coord.row + 1) * block;
        let cols = coord.col * block..(coord.col + 1) * block;

        for r in rows {
            for c in cols.clone() {
                let a_rc = self.a[(r, c)];
                for (i, &b_ci) in self.b.row(c).iter().enumerate() {
                    self.c.add(r, i, a_rc.wrapping_mul(b_ci));
                }
            }
        }
    }

    /// The product of the last completed run.
    pub fn result(&self) -> Result<Matrix> {
        if !self.complete {
            return Err(ProbeError::IncompletePass);
        }
        Ok(self.c.snapshot())
    }

    /// Compare the last completed run element-wise against `expected`.
    pub fn verify(&self, expected: &Matrix) -> Result<()> {
        let actual = self.result()?;
        compare(expected, &actual)
    }
}

/// Sequential triple-loop product, used as the correctness reference.
pub fn multiply_reference(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.dim() != b.dim() {
        return Err(invalid_config(format!(
            "cannot multiply {0}×{0} by {1}×{1}",
            a.dim(),
            b.dim()
        )));
    }
    let n = a.dim();
    Ok(Matrix::from_fn(n, |i, j| {
        (0..n).fold(0u64, |acc, p| acc.wrapping_add(a[(i, p)].wrapping_mul(b[(p, j)])))
    }))
}

fn compare(expected: &Matrix, actual: &Matrix) -> Result<()> {
    if expected.dim() != actual.dim() {
        return Err(invalid_config(format!(
            "reference is {0}×{0} but result is {1}×{1}",
            expected.dim(),
            actual.dim()
        )));
    }
    let n = expected.dim();
    for r in 0..n {
        for c in 0..n {
            if expected[(r, c)] != actual[(r, c)] {
                return Err(ProbeError::Mismatch {
                    location: format!("C[{r}][{c}]"),
                    expected: expected[(r, c)],
                    actual: actual[(r, c)],
                });
            }
        }
    }
    Ok(())
}

/// Multiply `a × b` on `threads` workers using `block`-sized tiles.
pub fn parallel_multiply(a: &Matrix, b: &Matrix, block: usize, threads: usize) -> Result<Matrix> {
    let layout = BlockLayout::from_dimension(a.dim(), block)?;
    let mut pass = SchedulingPass::new(layout, a, b)?;
    pass.run(threads)?;
    pass.result()
}

/// Time whole passes (spawn, compute, join) with the adaptive harness.
///
/// A failed pass makes the measurement unavailable: the error is returned
/// instead of a timing.
pub fn time_pass(
    timer: &Timer,
    pass: &mut SchedulingPass<'_>,
    threads: usize,
    error_tolerance: f64,
) -> Result<TimingResult> {
    time_pass_with(timer, pass, threads, error_tolerance, named("matmul"))
}

pub(crate) fn time_pass_with<B>(
    timer: &Timer,
    pass: &mut SchedulingPass<'_>,
    threads: usize,
    error_tolerance: f64,
    builder: B,
) -> Result<TimingResult>
where
    B: Fn(usize) -> io::Result<thread::Builder>,
{
    if threads == 0 {
        return Err(invalid_config("worker thread count must be positive"));
    }

    let mut failure = None;
    let timing = timer.time(
        || {
            if failure.is_none() {
                if let Err(e) = pass.run_with(threads, &builder) {
                    failure = Some(e);
                }
            }
        },
        error_tolerance,
    )?;

    match failure {
        Some(e) => Err(e),
        None => Ok(timing),
    }
}

/// Benchmark one matrix configuration and record it on `runner`.
///
/// With `verify` set, the final pass is checked against the sequential
/// reference before the row is recorded.
pub fn probe(
    runner: &mut ProbeRunner,
    layout: BlockLayout,
    threads: usize,
    seed: u64,
    verify: bool,
) -> Result<ProbeResult> {
    let dim = layout.dim();
    let a = Matrix::seeded(dim, seed);
    let b = Matrix::seeded(dim, seed.wrapping_add(1));

    let mut pass = SchedulingPass::new(layout, &a, &b)?;
    let timing = time_pass(&runner.timer(), &mut pass, threads, runner.tolerance())?;

    if verify {
        pass.verify(&multiply_reference(&a, &b)?)?;
        debug!("matmul {dim}×{dim} on {threads} threads matches reference");
    }

    let result = ProbeResult::from_timing(format!("matmul[t={threads}]"), ProbeKind::Matmul, &timing)
        .with_work_units(layout.multiply_adds())
        .with_tag("threads", threads)
        .with_tag("block", layout.block())
        .with_tag("dim", dim);
    Ok(runner.record(result).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::failing_at;

    fn identity(dim: usize) -> Matrix {
        Matrix::from_fn(dim, |r, c| u64::from(r == c))
    }

    #[test]
    fn should_reject_dimension_not_multiple_of_block() {
        assert!(BlockLayout::from_dimension(48, 16).is_ok());
        assert!(BlockLayout::from_dimension(50, 16).is_err());
        assert!(BlockLayout::from_dimension(0, 16).is_err());
        assert!(BlockLayout::from_dimension(16, 0).is_err());
        assert!(BlockLayout::new(0, 4).is_err());
    }

    #[test]
    fn should_reject_layout_too_large_to_address() {
        for (grid, block) in [(usize::MAX, 2), (1 << 20, 1 << 20), (1 << 16, 1 << 16)] {
            assert!(
                matches!(BlockLayout::new(grid, block), Err(ProbeError::InvalidConfig(_))),
                "{grid}×{block}"
            );
        }
        assert!(BlockLayout::from_dimension(usize::MAX, 1).is_err());
        assert!(BlockLayout::new(1 << 10, 1 << 10).is_ok());
    }

    #[test]
    fn should_count_multiply_adds_for_layout() {
        let layout = BlockLayout::new(4, 16).unwrap();
        assert_eq!(layout.dim(), 64);
        assert_eq!(layout.multiply_adds(), 64 * 64 * 64);
    }

    #[test]
    fn should_reproduce_input_when_multiplied_by_identity() {
        let a = Matrix::seeded(32, 7);
        let id = identity(32);
        assert_eq!(parallel_multiply(&a, &id, 8, 3).unwrap(), a);
        assert_eq!(parallel_multiply(&id, &a, 8, 3).unwrap(), a);
    }

    #[test]
    fn should_match_reference_for_hand_checked_product() {
        let a = Matrix::from_fn(2, |r, c| (r * 2 + c + 1) as u64); // [[1,2],[3,4]]
        let b = Matrix::from_fn(2, |r, c| (r * 2 + c + 5) as u64); // [[5,6],[7,8]]
        let expected = multiply_reference(&a, &b).unwrap();
        assert_eq!(expected.as_slice(), &[19, 22, 43, 50]);
        assert_eq!(parallel_multiply(&a, &b, 1, 2).unwrap(), expected);
    }

    #[test]
    fn should_match_reference_when_single_block_shared_by_four_workers() {
        let layout = BlockLayout::new(1, 16).unwrap();
        let a = Matrix::seeded(16, 1);
        let b = Matrix::seeded(16, 2);
        let mut pass = SchedulingPass::new(layout, &a, &b).unwrap();

        pass.run(4).unwrap();
        pass.verify(&multiply_reference(&a, &b).unwrap()).unwrap();
        assert!(pass.scheduler.is_exhausted());
    }

    #[test]
    fn should_reproduce_result_when_run_twice() {
        let layout = BlockLayout::new(3, 8).unwrap();
        let a = Matrix::seeded(24, 11);
        let b = Matrix::seeded(24, 12);
        let mut pass = SchedulingPass::new(layout, &a, &b).unwrap();

        pass.run(5).unwrap();
        let first = pass.result().unwrap();
        pass.run(5).unwrap();
        assert_eq!(pass.result().unwrap(), first);
    }

    #[test]
    fn should_refuse_result_before_pass_completes() {
        let layout = BlockLayout::new(2, 2).unwrap();
        let a = Matrix::zeros(4);
        let mut pass = SchedulingPass::new(layout, &a, &a).unwrap();
        assert!(matches!(pass.result(), Err(ProbeError::IncompletePass)));

        assert!(pass.run(0).is_err());
        assert!(matches!(pass.result(), Err(ProbeError::IncompletePass)));
    }

    #[test]
    fn should_withhold_result_when_worker_fails_to_spawn() {
        let layout = BlockLayout::new(2, 4).unwrap();
        let a = Matrix::seeded(8, 5);
        let b = Matrix::seeded(8, 6);
        let mut pass = SchedulingPass::new(layout, &a, &b).unwrap();

        let err = pass.run_with(4, failing_at(2)).unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { worker: 2, threads: 4, .. }));
        assert!(matches!(pass.result(), Err(ProbeError::IncompletePass)));
        assert!(matches!(
            pass.verify(&multiply_reference(&a, &b).unwrap()),
            Err(ProbeError::IncompletePass)
        ));

        pass.run(4).unwrap();
        pass.verify(&multiply_reference(&a, &b).unwrap()).unwrap();
    }

    #[test]
    fn should_return_spawn_error_instead_of_timing() {
        let layout = BlockLayout::new(2, 4).unwrap();
        let a = Matrix::seeded(8, 5);
        let timer = Timer::with_delta(crate::clock::Delta::from_secs(1e-6).unwrap());
        let mut pass = SchedulingPass::new(layout, &a, &a).unwrap();

        let err = time_pass_with(&timer, &mut pass, 3, 0.1, failing_at(0)).unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { worker: 0, .. }));
        assert!(matches!(pass.result(), Err(ProbeError::IncompletePass)));
    }

    #[test]
    fn should_report_first_mismatching_element() {
        let expected = Matrix::from_fn(3, |r, c| (r + c) as u64);
        let mut data = expected.clone();
        data.data[5] += 1;

        match compare(&expected, &data) {
            Err(ProbeError::Mismatch { location, expected, actual }) => {
                assert_eq!(location, "C[1][2]");
                assert_eq!(actual, expected + 1);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn should_reject_inputs_that_do_not_fit_layout() {
        let layout = BlockLayout::new(2, 4).unwrap();
        let small = Matrix::zeros(4);
        let right = Matrix::zeros(8);
        assert!(SchedulingPass::new(layout, &small, &right).is_err());
    }

    #[test]
    fn should_wrap_on_overflow_like_reference() {
        let a = Matrix::from_fn(4, |_, _| u64::MAX);
        let b = Matrix::from_fn(4, |_, _| 3);
        let expected = multiply_reference(&a, &b).unwrap();
        assert_eq!(parallel_multiply(&a, &b, 2, 4).unwrap(), expected);
    }
}
