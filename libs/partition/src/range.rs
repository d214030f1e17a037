//! The `(lower, upper]` key interval.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Smallest workload key.
pub const KEY_MIN: i64 = 0;

/// Largest workload key; the highest instance always ends here.
pub const KEY_MAX: i64 = i64::MAX;

/// A contiguous slice of the workload key space owned by one instance.
///
/// Ranges are half-open `(lower, upper]`, except that a range starting at
/// [`KEY_MIN`] also owns key `0` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: i64,
    pub upper: i64,
}

impl KeyRange {
    /// The whole key space, owned by a solo instance.
    pub const FULL: KeyRange = KeyRange {
        lower: KEY_MIN,
        upper: KEY_MAX,
    };

    /// Create a range from its bounds.
    pub const fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    /// Whether this is the lowest range (closed on the left).
    pub const fn is_first(&self) -> bool {
        self.lower == KEY_MIN
    }

    /// Whether this is the highest range.
    pub const fn is_last(&self) -> bool {
        self.upper == KEY_MAX
    }

    /// Number of keys in the range, used to compare candidates for splitting.
    ///
    /// A first range gets `+1` for key `0`, unless it is the full space
    /// (whose true size does not fit in an `i64`).
    pub fn size(&self) -> i64 {
        let span = self.upper - self.lower;
        if self.lower == KEY_MIN && self.upper != KEY_MAX {
            span + 1
        } else {
            span
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: i64) -> bool {
        if key < KEY_MIN {
            return false;
        }
        (self.lower == KEY_MIN && key == KEY_MIN) || (self.lower < key && key <= self.upper)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_first() {
            write!(f, "[{}, {}]", self.lower, self.upper)
        } else {
            write!(f, "({}, {}]", self.lower, self.upper)
        }
    }
}
