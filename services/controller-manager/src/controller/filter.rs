//! Informer reset messages.

use scf_partition::KeyRange;

/// Published whenever a controller's own range changes.
///
/// Informers purge cached objects whose keys left `[lower_bound, upper_bound]`
/// and re-list the keys that entered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterBound {
    pub owner_name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
}

impl FilterBound {
    pub fn new(owner_name: impl Into<String>, range: KeyRange) -> Self {
        Self {
            owner_name: owner_name.into(),
            lower_bound: range.lower,
            upper_bound: range.upper,
        }
    }

    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lower_bound, self.upper_bound)
    }

    /// Whether an informer should keep an object with this key.
    pub fn contains(&self, key: i64) -> bool {
        self.range().contains(key)
    }
}
