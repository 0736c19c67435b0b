//! Puzzle provider trait and the backtracking sudoku implementation

use crate::puzzle::grid::{Grid, Mask, SIZE};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Mutex;

/// Source of fresh puzzles for new matches
#[cfg_attr(test, mockall::automock)]
pub trait PuzzleProvider: Send + Sync {
    /// A completely filled, valid grid
    fn generate_solution(&self) -> Grid;

    /// A mask that leaves `solution` uniquely solvable with no removable clue
    fn minimal_mask(&self, solution: &Grid) -> Mask;
}

/// Playable starting grid: a fresh solution with its minimal mask applied
pub fn generate_puzzle(provider: &dyn PuzzleProvider) -> Grid {
    let solution = provider.generate_solution();
    let mask = provider.minimal_mask(&solution);
    solution.apply_mask(&mask)
}

/// Randomized backtracking generator
pub struct SudokuProvider {
    rng: Mutex<StdRng>,
}

impl SudokuProvider {
    /// Provider seeded from the operating system
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic provider, for tests and benches
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        // A poisoned lock only means another generator panicked mid-shuffle;
        // the rng state itself is still usable.
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

impl Default for SudokuProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PuzzleProvider for SudokuProvider {
    fn generate_solution(&self) -> Grid {
        self.with_rng(|rng| {
            let mut grid = Grid::empty();
            let filled = fill(&mut grid, rng);
            debug_assert!(filled, "an empty grid always has a solution");
            grid
        })
    }

    fn minimal_mask(&self, solution: &Grid) -> Mask {
        let mut order: Vec<(usize, usize)> = (0..SIZE)
            .flat_map(|row| (0..SIZE).map(move |col| (row, col)))
            .collect();
        self.with_rng(|rng| order.shuffle(rng));

        let mut mask = Mask::full();
        let mut puzzle = *solution;
        for (row, col) in order {
            let Some(digit) = puzzle.get(row, col) else {
                continue;
            };
            puzzle.clear(row, col);
            if count_solutions(&mut puzzle, 2) == 1 {
                mask.set(row, col, false);
            } else {
                puzzle.set(row, col, digit);
            }
        }
        mask
    }
}

/// Blank cell with the fewest candidates, or `None` when the grid is full
fn most_constrained(grid: &Grid) -> Option<(usize, usize, u16)> {
    let mut best: Option<(usize, usize, u16)> = None;
    for row in 0..SIZE {
        for col in 0..SIZE {
            if !grid.is_blank(row, col) {
                continue;
            }
            let candidates = grid.candidates(row, col);
            let better = match best {
                Some((_, _, current)) => candidates.count_ones() < current.count_ones(),
                None => true,
            };
            if better {
                best = Some((row, col, candidates));
                if candidates.count_ones() <= 1 {
                    return best;
                }
            }
        }
    }
    best
}

fn digits(candidates: u16) -> impl Iterator<Item = u8> {
    (1u8..=9).filter(move |d| candidates & (1 << d) != 0)
}

/// Fill every blank cell with a random valid assignment
fn fill(grid: &mut Grid, rng: &mut StdRng) -> bool {
    let Some((row, col, candidates)) = most_constrained(grid) else {
        return true;
    };

    let mut options: Vec<u8> = digits(candidates).collect();
    options.shuffle(rng);
    for digit in options {
        grid.set(row, col, digit);
        if fill(grid, rng) {
            return true;
        }
    }
    grid.clear(row, col);
    false
}

/// Count solutions of `grid`, stopping at `limit`. The grid is restored on return.
pub fn count_solutions(grid: &mut Grid, limit: usize) -> usize {
    let Some((row, col, candidates)) = most_constrained(grid) else {
        return 1;
    };

    let mut found = 0;
    for digit in digits(candidates) {
        grid.set(row, col, digit);
        found += count_solutions(grid, limit - found);
        if found >= limit {
            break;
        }
    }
    grid.clear(row, col);
    found
}
