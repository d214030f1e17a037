//! Local mirror of one controller instance's position on the key space.

use crate::range::{KeyRange, KEY_MIN};

/// One entry of the sorted, locally held roster of a controller type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSlot {
    pub name: String,
    pub lowerbound_key: i64,
    pub controller_key: i64,
    pub workload_num: i32,
    pub is_locked: bool,
}

impl InstanceSlot {
    /// Create a slot; the lower bound is filled in by [`assign_ranges`].
    pub fn new(
        name: impl Into<String>,
        controller_key: i64,
        workload_num: i32,
        is_locked: bool,
    ) -> Self {
        Self {
            name: name.into(),
            lowerbound_key: KEY_MIN,
            controller_key,
            workload_num,
            is_locked,
        }
    }

    /// The range this slot owns.
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lowerbound_key, self.controller_key)
    }
}

/// Fill in lower bounds of an already sorted roster.
///
/// The first slot always starts at [`KEY_MIN`]; every other slot starts at
/// its predecessor's `controller_key`.
pub fn assign_ranges(slots: &mut [InstanceSlot]) {
    let mut lower = KEY_MIN;
    for slot in slots.iter_mut() {
        slot.lowerbound_key = lower;
        lower = slot.controller_key;
    }
}

/// Sort by `controller_key` (name breaks ties) and assign ranges.
pub fn sort_and_assign(slots: &mut [InstanceSlot]) {
    slots.sort_by(|a, b| {
        a.controller_key
            .cmp(&b.controller_key)
            .then_with(|| a.name.cmp(&b.name))
    });
    assign_ranges(slots);
}

/// Index of the slot named `name`.
pub fn position_of(slots: &[InstanceSlot], name: &str) -> Option<usize> {
    slots.iter().position(|s| s.name == name)
}

/// Index of the slot owning `key` in a sorted, assigned roster.
pub fn owner_of(slots: &[InstanceSlot], key: i64) -> Option<usize> {
    if key < KEY_MIN {
        return None;
    }
    let idx = slots.partition_point(|s| s.controller_key < key);
    (idx < slots.len() && slots[idx].range().contains(key)).then_some(idx)
}
