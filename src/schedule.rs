//! Shared block cursor for dynamically partitioned work.
//!
//! A [`BlockScheduler`] hands out the tiles of a `size × size` grid one at a
//! time. Workers call [`claim_block`](BlockScheduler::claim_block) until it
//! returns `None`; every tile is handed out exactly once per pass no matter
//! how many workers race for it.

use crate::error::{invalid_config, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Position of a tile in the block grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockCoordinate {
    pub row: usize,
    pub col: usize,
}

impl BlockCoordinate {
    pub const ORIGIN: BlockCoordinate = BlockCoordinate { row: 0, col: 0 };

    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for BlockCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Next(BlockCoordinate),
    Exhausted,
}

/// Mutex-protected cursor over a square grid of blocks.
#[derive(Debug)]
pub struct BlockScheduler {
    size: usize,
    cursor: Mutex<Cursor>,
}

impl BlockScheduler {
    /// Create a scheduler over a `size × size` grid, positioned at the origin.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(invalid_config("block grid must be at least 1×1"));
        }
        Ok(Self {
            size,
            cursor: Mutex::new(Cursor::Next(BlockCoordinate::ORIGIN)),
        })
    }

    /// Width (and height) of the grid in blocks.
    pub fn grid_size(&self) -> usize {
        self.size
    }

    /// Total number of blocks handed out per pass.
    pub fn block_count(&self) -> usize {
        self.size * self.size
    }

    /// Claim the next unprocessed block, or `None` once the grid is exhausted.
    ///
    /// The lock is held only while the cursor is read and advanced.
    pub fn claim_block(&self) -> Option<BlockCoordinate> {
        let mut cursor = self.lock();
        let claimed = match *cursor {
            Cursor::Exhausted => return None,
            Cursor::Next(coord) => coord,
        };
        *cursor = self.advance(claimed);
        Some(claimed)
    }

    /// Rewind the cursor to the origin for a new pass.
    pub fn reset(&self) {
        *self.lock() = Cursor::Next(BlockCoordinate::ORIGIN);
    }

    pub fn is_exhausted(&self) -> bool {
        *self.lock() == Cursor::Exhausted
    }

    fn advance(&self, coord: BlockCoordinate) -> Cursor {
        if coord.col + 1 < self.size {
            Cursor::Next(BlockCoordinate::new(coord.row, coord.col + 1))
        } else if coord.row + 1 < self.size {
            Cursor::Next(BlockCoordinate::new(coord.row + 1, 0))
        } else {
            Cursor::Exhausted
        }
    }

    // Nothing can panic while the cursor is held, so a poisoned lock still
    // guards a consistent cursor.
    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::thread;

    fn drain_concurrently(scheduler: &BlockScheduler, workers: usize) -> Vec<Vec<BlockCoordinate>> {
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut claimed = Vec::new();
                        while let Some(coord) = scheduler.claim_block() {
                            claimed.push(coord);
                        }
                        claimed
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn should_visit_columns_then_rows_in_order() {
        let scheduler = BlockScheduler::new(3).unwrap();
        let order: Vec<_> = std::iter::from_fn(|| scheduler.claim_block()).collect();

        let expected: Vec<_> = (0..3)
            .flat_map(|row| (0..3).map(move |col| BlockCoordinate::new(row, col)))
            .collect();
        assert_eq!(order, expected);
        assert!(scheduler.is_exhausted());
    }

    #[test]
    fn should_keep_returning_none_once_exhausted() {
        let scheduler = BlockScheduler::new(1).unwrap();
        assert_eq!(scheduler.claim_block(), Some(BlockCoordinate::ORIGIN));
        for _ in 0..5 {
            assert_eq!(scheduler.claim_block(), None);
        }
    }

    #[test]
    fn should_restart_from_origin_when_reset() {
        let scheduler = BlockScheduler::new(2).unwrap();
        while scheduler.claim_block().is_some() {}

        scheduler.reset();
        assert!(!scheduler.is_exhausted());
        assert_eq!(scheduler.claim_block(), Some(BlockCoordinate::ORIGIN));
    }

    #[test]
    fn should_reject_empty_grid() {
        assert!(BlockScheduler::new(0).is_err());
    }

    #[test]
    fn should_grant_single_block_to_exactly_one_worker() {
        let scheduler = BlockScheduler::new(1).unwrap();
        let per_worker = drain_concurrently(&scheduler, 4);

        let winners = per_worker.iter().filter(|c| !c.is_empty()).count();
        assert_eq!(winners, 1);
        assert_eq!(per_worker.iter().map(Vec::len).sum::<usize>(), 1);
    }

    proptest! {
        #[test]
        fn prop_every_block_claimed_exactly_once(size in 1usize..12, workers in 1usize..16) {
            let scheduler = BlockScheduler::new(size).unwrap();
            let claimed: Vec<_> = drain_concurrently(&scheduler, workers)
                .into_iter()
                .flatten()
                .collect();

            prop_assert_eq!(claimed.len(), size * size);
            let unique: HashSet<_> = claimed.iter().copied().collect();
            prop_assert_eq!(unique.len(), claimed.len());
            prop_assert!(claimed.iter().all(|c| c.row < size && c.col < size));
        }
    }
}
