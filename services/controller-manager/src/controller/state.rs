//! Controller states and the pure transition step driven by roster snapshots.

use std::fmt;

use scf_partition::{
    position_of, sort_and_assign, split_point, InstanceSlot, KeyRange, PartitionResult,
    RangeChange, Split, KEY_MAX,
};
use scf_registry::ControllerInstance;

use crate::instance_manager::InstanceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// Not registered yet.
    Init,
    /// Registered as a joiner; waiting for the successor to hand off.
    Locked,
    /// Range shrank; draining in-flight work before serving again.
    Wait,
    Active,
    /// Lost membership; terminal.
    Error,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Locked => "locked",
            Self::Wait => "wait",
            Self::Active => "active",
            Self::Error => "error",
        }
    }

    /// Whether keys in range are considered owned by this instance.
    pub fn owns_range(&self) -> bool {
        matches!(self, Self::Active | Self::Wait)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sorted local mirror of one controller type's live instances.
///
/// The highest instance always extends to `KEY_MAX`, even before it has
/// pinned its persisted key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    slots: Vec<InstanceSlot>,
}

impl Roster {
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a ControllerInstance>) -> Self {
        let mut slots: Vec<InstanceSlot> = instances
            .into_iter()
            .filter(|i| !i.is_deleted())
            .map(|i| {
                InstanceSlot::new(
                    i.name.clone(),
                    i.controller_key,
                    i.workload_num,
                    i.is_locked,
                )
            })
            .collect();
        sort_and_assign(&mut slots);
        if let Some(last) = slots.last_mut() {
            last.controller_key = KEY_MAX;
        }
        Self { slots }
    }

    pub fn slots(&self) -> &[InstanceSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        position_of(&self.slots, name)
    }

    pub fn range_at(&self, pos: usize) -> Option<KeyRange> {
        self.slots.get(pos).map(InstanceSlot::range)
    }

    pub fn is_rightmost(&self, pos: usize) -> bool {
        pos + 1 == self.slots.len()
    }

    pub fn predecessor(&self, pos: usize) -> Option<&InstanceSlot> {
        pos.checked_sub(1).and_then(|p| self.slots.get(p))
    }

    /// Where a joiner should cut in.
    pub fn split_point(&self) -> PartitionResult<Split> {
        split_point(&self.slots)
    }
}

/// Result of applying one roster snapshot to the local controller.
#[derive(Debug, Clone)]
pub enum Observation {
    /// Self is not in the snapshot and never was.
    NotYetVisible,
    /// Self was seen before and is now gone.
    LostMembership,
    Step(Step),
}

/// What the controller should do after a snapshot.
#[derive(Debug, Clone)]
pub struct Step {
    pub state: ControllerState,
    pub roster: Roster,
    pub position: usize,
    pub change: RangeChange,
    /// Persist `controller_key = KEY_MAX` for self.
    pub pin_key: bool,
    /// Persist `is_locked = false` for self.
    pub clear_lock: bool,
    /// Locked predecessor to unlock.
    pub unlock_predecessor: Option<String>,
}

/// Compute the next state from a roster snapshot.
///
/// - `Locked -> Active` once self is unlocked or has no successor.
/// - `Active -> Wait` when any key of the old range moved away.
/// - Range extensions never require a drain.
/// - Only an `Active` instance unlocks its locked predecessor.
pub fn observe(
    name: &str,
    state: ControllerState,
    range: KeyRange,
    seen_self: bool,
    snapshot: &InstanceMap,
) -> Observation {
    let Some(me) = snapshot.get(name).filter(|i| !i.is_deleted()) else {
        return if seen_self {
            Observation::LostMembership
        } else {
            Observation::NotYetVisible
        };
    };

    let roster = Roster::from_instances(snapshot.values());
    let Some(position) = roster.position_of(name) else {
        return Observation::NotYetVisible;
    };
    let new_range = roster.range_at(position).unwrap_or(range);
    let change = RangeChange::new(range, new_range);
    let rightmost = roster.is_rightmost(position);

    let next = match state {
        ControllerState::Locked if !me.is_locked || rightmost => ControllerState::Active,
        ControllerState::Active if change.is_shrinking() => ControllerState::Wait,
        other => other,
    };

    let unlock_predecessor = if next == ControllerState::Active {
        roster
            .predecessor(position)
            .filter(|p| p.is_locked)
            .map(|p| p.name.clone())
    } else {
        None
    };

    Observation::Step(Step {
        state: next,
        pin_key: rightmost && me.controller_key != KEY_MAX,
        clear_lock: me.is_locked && next != ControllerState::Locked,
        unlock_predecessor,
        roster,
        position,
        change,
    })
}
