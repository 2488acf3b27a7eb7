//! Chess board geometry

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ArmCtrlError;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of files and ranks on the board.
pub const BOARD_SIZE: u8 = 8;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Placement of the board in the robot base frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardParams {
    /// Centre of square a1.
    ///
    /// Units: millimetres
    pub origin_mm: [f64; 2],

    /// Distance between the centres of adjacent squares. Files run along the
    /// base x axis and ranks along the base y axis.
    ///
    /// Units: millimetres
    pub square_pitch_mm: f64,
}

/// A square of the board, zero based file (a = 0) and rank (1 = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    file: u8,
    rank: u8,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for BoardParams {
    fn default() -> Self {
        Self {
            origin_mm: [-87.5, 100.0],
            square_pitch_mm: 25.0,
        }
    }
}

impl BoardParams {
    /// Centre of a square as `(x_mm, y_mm)` in the base frame.
    pub fn square_centre(&self, square: Square) -> (f64, f64) {
        (
            self.origin_mm[0] + square.file as f64 * self.square_pitch_mm,
            self.origin_mm[1] + square.rank as f64 * self.square_pitch_mm,
        )
    }
}

impl Square {
    /// Build a square from zero based file and rank indices.
    pub fn new(file: u8, rank: u8) -> Option<Self> {
        if file < BOARD_SIZE && rank < BOARD_SIZE {
            Some(Self { file, rank })
        } else {
            None
        }
    }

    pub fn file(&self) -> u8 {
        self.file
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }

    /// All 64 squares, a1 first, h8 last.
    pub fn all() -> impl Iterator<Item = Square> {
        (0..BOARD_SIZE).flat_map(|rank| (0..BOARD_SIZE).map(move |file| Square { file, rank }))
    }
}

impl FromStr for Square {
    type Err = ArmCtrlError;

    /// Parse `[a-h][1-8]`, the file letter may be upper case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ArmCtrlError::InvalidSquare(s.to_string());

        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return Err(invalid());
        }

        let file = bytes[0].to_ascii_lowercase();
        let rank = bytes[1];

        if !(b'a'..=b'h').contains(&file) || !(b'1'..=b'8').contains(&rank) {
            return Err(invalid());
        }

        Ok(Square {
            file: file - b'a',
            rank: rank - b'1',
        })
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'a' + self.file) as char, self.rank + 1)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
