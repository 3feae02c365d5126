//! Source locations.

use std::fmt;

/// A position in a source file. Both fields are 1-based; `0:0` only occurs
/// inside [`NOWHERE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct Loc {
    /// Line number (first line is 1).
    pub line: u32,
    /// Column number (first character is 1).
    pub column: u32,
}

impl Loc {
    /// Creates a location from a line/column pair.
    #[must_use]
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A range in a source file, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct LocRange {
    /// Start position.
    pub start: Loc,
    /// End position.
    pub end: Loc,
}

/// Sentinel range for synthesized code with no source position.
pub const NOWHERE: LocRange = LocRange {
    start: Loc { line: 0, column: 0 },
    end: Loc { line: 0, column: 0 },
};

impl LocRange {
    /// Creates a range from start/end positions.
    #[must_use]
    pub const fn new(start: Loc, end: Loc) -> Self {
        Self { start, end }
    }

    /// Returns `true` if this is the [`NOWHERE`] sentinel.
    #[must_use]
    pub fn is_nowhere(&self) -> bool {
        *self == NOWHERE
    }

    /// Returns the smallest range covering both `self` and `other`.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            start: self.start,
            end: other.end,
        }
    }
}

impl fmt::Display for LocRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}:{}",
            self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}
