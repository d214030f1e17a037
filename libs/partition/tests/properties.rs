//! Property tests for the partition invariants.

use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use scf_partition::{
    owner_of, sort_and_assign, split_point, InstanceSlot, KeyRange, KEY_MAX, KEY_MIN,
};

/// A valid roster: distinct keys, the highest pinned to `KEY_MAX`.
fn roster_strategy() -> impl Strategy<Value = Vec<InstanceSlot>> {
    (btree_set(1..KEY_MAX, 0..16), vec(0..100i32, 16)).prop_map(|(keys, workloads)| {
        let mut slots: Vec<_> = keys
            .into_iter()
            .chain(std::iter::once(KEY_MAX))
            .enumerate()
            .map(|(i, key)| InstanceSlot::new(format!("ci-{i}"), key, workloads[i % 16], false))
            .collect();
        sort_and_assign(&mut slots);
        slots
    })
}

fn sample_keys(slots: &[InstanceSlot], extra: &[i64]) -> Vec<i64> {
    let mut keys = vec![KEY_MIN, KEY_MAX];
    for slot in slots {
        keys.push(slot.controller_key);
        keys.push(slot.controller_key.saturating_add(1).min(KEY_MAX));
        keys.push(slot.controller_key.saturating_sub(1).max(KEY_MIN));
    }
    keys.extend_from_slice(extra);
    keys
}

fn owners(slots: &[InstanceSlot], key: i64) -> usize {
    slots.iter().filter(|s| s.range().contains(key)).count()
}

proptest! {
    #[test]
    fn prop_partition_is_complete(slots in roster_strategy(), extra in vec(0..=KEY_MAX, 32)) {
        for key in sample_keys(&slots, &extra) {
            prop_assert_eq!(owners(&slots, key), 1, "key {} owned by wrong count", key);
            prop_assert!(owner_of(&slots, key).is_some());
        }
    }

    #[test]
    fn prop_keys_are_monotonic(slots in roster_strategy()) {
        prop_assert_eq!(slots[0].lowerbound_key, KEY_MIN);
        for pair in slots.windows(2) {
            prop_assert!(pair[0].controller_key < pair[1].controller_key);
            prop_assert_eq!(pair[1].lowerbound_key, pair[0].controller_key);
        }
    }

    #[test]
    fn prop_split_is_fair(slots in roster_strategy()) {
        let Ok(split) = split_point(&slots) else {
            return Ok(());
        };
        let range = slots[split.index].range();
        let left = KeyRange::new(range.lower, split.key);
        let right = KeyRange::new(split.key, range.upper);

        prop_assert!(left.size() >= right.size());
        prop_assert!(left.size() - right.size() <= 1);
    }

    #[test]
    fn prop_split_picks_a_largest_range(slots in roster_strategy()) {
        let Ok(split) = split_point(&slots) else {
            return Ok(());
        };
        let max = slots.iter().map(|s| s.range().size()).max().unwrap();
        let chosen = slots[split.index].range().size();
        prop_assert!(max - chosen <= 1);
        for (idx, slot) in slots.iter().enumerate() {
            if slot.range().size().abs_diff(max) <= 1 {
                let best = &slots[split.index];
                prop_assert!(best.workload_num >= slot.workload_num);
                if best.workload_num == slot.workload_num {
                    prop_assert!(split.index <= idx);
                }
            }
        }
    }

    #[test]
    fn prop_joins_keep_partition(workloads in vec(0..50i32, 1..24), extra in vec(0..=KEY_MAX, 16)) {
        let mut slots = vec![InstanceSlot::new("ci-0", KEY_MAX, 0, false)];
        for (i, workload) in workloads.into_iter().enumerate() {
            let split = split_point(&slots).unwrap();
            slots.push(InstanceSlot::new(format!("ci-{}", i + 1), split.key, workload, true));
            sort_and_assign(&mut slots);

            for key in sample_keys(&slots, &extra) {
                prop_assert_eq!(owners(&slots, key), 1);
            }
        }
    }
}
