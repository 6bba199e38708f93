//! Grid coordinate, size, and rotation types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a cell in an inventory grid, or an offset between two cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GridPos {
    /// Column
    pub x: i32,
    /// Row
    pub y: i32,
}

impl GridPos {
    /// Creates a new grid position.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The origin / zero offset.
    pub const ZERO: Self = Self::new(0, 0);

    /// Component-wise sum.
    #[must_use]
    pub const fn offset(self, by: Self) -> Self {
        Self::new(self.x + by.x, self.y + by.y)
    }

    /// Component-wise difference.
    #[must_use]
    pub const fn minus(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Footprint of an item in grid cells.
///
/// Signed so that malformed item data (zero or negative sizes) can be
/// represented and rejected by placement checks instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    /// Width in cells
    pub width: i32,
    /// Height in cells
    pub height: i32,
}

impl GridSize {
    /// Creates a new size.
    #[must_use]
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// A single cell.
    pub const ONE: Self = Self::new(1, 1);

    /// Number of covered cells, zero for degenerate sizes.
    #[must_use]
    pub const fn area(self) -> i32 {
        if self.is_valid() {
            self.width * self.height
        } else {
            0
        }
    }

    /// Width and height swapped.
    #[must_use]
    pub const fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }

    /// Effective footprint with the 90 degree swap applied when `rotated`.
    #[must_use]
    pub const fn footprint(self, rotated: bool) -> Self {
        if rotated {
            self.transposed()
        } else {
            self
        }
    }

    /// Square items look the same at every rotation.
    #[must_use]
    pub const fn is_square(self) -> bool {
        self.width == self.height
    }

    /// Both dimensions strictly positive.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Checks if this footprint fits inside `limit` without rotating.
    #[must_use]
    pub const fn fits_within(self, limit: Self) -> bool {
        self.width <= limit.width && self.height <= limit.height
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Item rotation in quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    /// Not rotated
    #[default]
    Deg0,
    /// 90 degrees clockwise
    Deg90,
    /// 180 degrees
    Deg180,
    /// 270 degrees clockwise
    Deg270,
}

impl Rotation {
    /// All rotations in clockwise order.
    pub const ALL: [Self; 4] = [Self::Deg0, Self::Deg90, Self::Deg180, Self::Deg270];

    /// Parses a degree value; only exact multiples of 90 are accepted.
    #[must_use]
    pub const fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    /// Rotation value in degrees.
    #[must_use]
    pub const fn degrees(self) -> i32 {
        self.quarter_turns() as i32 * 90
    }

    /// Number of clockwise quarter turns (0..=3).
    #[must_use]
    pub const fn quarter_turns(self) -> u8 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 1,
            Self::Deg180 => 2,
            Self::Deg270 => 3,
        }
    }

    /// Builds a rotation from quarter turns, wrapping modulo 4.
    #[must_use]
    pub const fn from_quarter_turns(turns: u8) -> Self {
        Self::ALL[(turns % 4) as usize]
    }

    /// Next rotation clockwise.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::from_quarter_turns(self.quarter_turns() + 1)
    }

    /// True when width and height of the footprint are swapped.
    #[must_use]
    pub const fn is_transposed(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// Applies this rotation to a base item size.
    #[must_use]
    pub const fn apply(self, size: GridSize) -> GridSize {
        size.footprint(self.is_transposed())
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}
