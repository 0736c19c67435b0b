//! 9×9 sudoku grid with its textual serialization
//!
//! Serialized form is nine lines of nine characters, `.` for a blank cell.
//! Parsing also accepts a space or `0` as blank so grids written by other
//! tools load unchanged.

use crate::error::EngineError;
use std::fmt;

/// Side length of the grid
pub const SIZE: usize = 9;
/// Side length of a box
pub const BOX: usize = 3;

const BLANK: u8 = 0;

/// Cell matrix; `0` marks a blank cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Grid {
    cells: [[u8; SIZE]; SIZE],
}

/// Which cells of a solution stay visible in the playable puzzle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask {
    keep: [[bool; SIZE]; SIZE],
}

impl Mask {
    /// Mask keeping every cell
    pub fn full() -> Self {
        Self {
            keep: [[true; SIZE]; SIZE],
        }
    }

    pub fn keeps(&self, row: usize, col: usize) -> bool {
        self.keep[row][col]
    }

    pub fn set(&mut self, row: usize, col: usize, keep: bool) {
        self.keep[row][col] = keep;
    }

    /// Number of visible cells
    pub fn clue_count(&self) -> usize {
        self.keep.iter().flatten().filter(|k| **k).count()
    }
}

/// Rule violation found by `Grid::validate`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridViolation {
    #[error("digit {digit} repeated in row {index}")]
    Row { index: usize, digit: u8 },
    #[error("digit {digit} repeated in column {index}")]
    Column { index: usize, digit: u8 },
    #[error("digit {digit} repeated in box {index}")]
    Box { index: usize, digit: u8 },
}

impl Grid {
    /// All-blank grid
    pub fn empty() -> Self {
        Self {
            cells: [[BLANK; SIZE]; SIZE],
        }
    }

    pub fn from_rows(cells: [[u8; SIZE]; SIZE]) -> Self {
        Self { cells }
    }

    /// Parse the textual serialization
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let decode_err = |message: String| EngineError::Decode {
            what: "grid".to_string(),
            message,
        };

        let mut grid = Self::empty();
        let mut count = 0usize;

        for ch in text.chars().filter(|c| *c != '\n' && *c != '\r') {
            if count >= SIZE * SIZE {
                return Err(decode_err(format!("more than {} cells", SIZE * SIZE)));
            }
            let value = match ch {
                '.' | ' ' | '0' => BLANK,
                '1'..='9' => ch as u8 - b'0',
                other => return Err(decode_err(format!("invalid cell character {:?}", other))),
            };
            grid.cells[count / SIZE][count % SIZE] = value;
            count += 1;
        }

        if count != SIZE * SIZE {
            return Err(decode_err(format!(
                "expected {} cells, found {}",
                SIZE * SIZE,
                count
            )));
        }

        Ok(grid)
    }

    /// Digit at a cell, `None` when blank
    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        match self.cells[row][col] {
            BLANK => None,
            digit => Some(digit),
        }
    }

    pub fn is_blank(&self, row: usize, col: usize) -> bool {
        self.cells[row][col] == BLANK
    }

    /// Write a digit (1–9) into a cell; any digit is accepted at any cell
    pub fn set(&mut self, row: usize, col: usize, digit: u8) {
        debug_assert!((1..=9).contains(&digit));
        self.cells[row][col] = digit;
    }

    pub fn clear(&mut self, row: usize, col: usize) {
        self.cells[row][col] = BLANK;
    }

    /// Number of blank cells
    pub fn num_unknowns(&self) -> usize {
        self.cells.iter().flatten().filter(|c| **c == BLANK).count()
    }

    /// Check that no digit repeats within a row, column or box. Blanks are ignored.
    pub fn validate(&self) -> Result<(), GridViolation> {
        for index in 0..SIZE {
            if let Some(digit) = first_repeat((0..SIZE).map(|c| self.cells[index][c])) {
                return Err(GridViolation::Row { index, digit });
            }
            if let Some(digit) = first_repeat((0..SIZE).map(|r| self.cells[r][index])) {
                return Err(GridViolation::Column { index, digit });
            }
            let (top, left) = ((index / BOX) * BOX, (index % BOX) * BOX);
            let cells = (0..SIZE).map(|i| self.cells[top + i / BOX][left + i % BOX]);
            if let Some(digit) = first_repeat(cells) {
                return Err(GridViolation::Box { index, digit });
            }
        }
        Ok(())
    }

    /// Filled and valid
    pub fn is_solved(&self) -> bool {
        self.num_unknowns() == 0 && self.validate().is_ok()
    }

    /// Blank every cell the mask hides
    pub fn apply_mask(&self, mask: &Mask) -> Self {
        let mut masked = *self;
        for row in 0..SIZE {
            for col in 0..SIZE {
                if !mask.keeps(row, col) {
                    masked.cells[row][col] = BLANK;
                }
            }
        }
        masked
    }

    /// Digits that could legally go into a blank cell, as a bitset (bit d = digit d)
    pub(crate) fn candidates(&self, row: usize, col: usize) -> u16 {
        let mut used = 0u16;
        let (top, left) = ((row / BOX) * BOX, (col / BOX) * BOX);
        for i in 0..SIZE {
            used |= 1 << self.cells[row][i];
            used |= 1 << self.cells[i][col];
            used |= 1 << self.cells[top + i / BOX][left + i % BOX];
        }
        !used & 0b11_1111_1110
    }
}

fn first_repeat(cells: impl Iterator<Item = u8>) -> Option<u8> {
    let mut seen = 0u16;
    for digit in cells.filter(|d| *d != BLANK) {
        if seen & (1 << digit) != 0 {
            return Some(digit);
        }
        seen |= 1 << digit;
    }
    None
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.cells.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            for cell in row {
                match *cell {
                    BLANK => write!(f, ".")?,
                    digit => write!(f, "{}", digit)?,
                }
            }
        }
        Ok(())
    }
}
