//! Classifying how an instance's own range moved between two rosters.

use crate::range::KeyRange;

/// Old and new range of the local instance after a roster change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeChange {
    pub old: KeyRange,
    pub new: KeyRange,
}

impl RangeChange {
    pub fn new(old: KeyRange, new: KeyRange) -> Self {
        Self { old, new }
    }

    pub fn is_self_range_updated(&self) -> bool {
        self.old != self.new
    }

    /// A joiner took the bottom of our range.
    pub fn is_lower_bound_raised(&self) -> bool {
        self.new.lower > self.old.lower
    }

    pub fn is_upper_bound_lowered(&self) -> bool {
        self.new.upper < self.old.upper
    }

    /// A predecessor died and its keys merged into ours.
    pub fn is_lower_bound_extended(&self) -> bool {
        self.new.lower < self.old.lower
    }

    /// We became the highest instance and own up to `KEY_MAX`.
    pub fn is_upper_bound_extended(&self) -> bool {
        self.new.upper > self.old.upper
    }

    /// Whether any key we owned now belongs to someone else.
    pub fn is_shrinking(&self) -> bool {
        self.is_lower_bound_raised() || self.is_upper_bound_lowered()
    }

    /// Whether the key was ours and no longer is.
    pub fn is_released(&self, key: i64) -> bool {
        self.old.contains(key) && !self.new.contains(key)
    }

    /// Whether the key is newly ours.
    pub fn is_acquired(&self, key: i64) -> bool {
        !self.old.contains(key) && self.new.contains(key)
    }
}
