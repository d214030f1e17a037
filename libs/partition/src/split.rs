//! Choosing where a joining instance cuts into the key space.

use crate::error::{PartitionError, PartitionResult};
use crate::range::{KeyRange, KEY_MIN};
use crate::slot::InstanceSlot;

/// The outcome of [`split_point`]: which slot is split and the joiner's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub index: usize,
    pub key: i64,
}

/// Pick the slot a joiner should split.
///
/// Precedence: largest size (sizes within 1 of the maximum count as equal),
/// then larger `workload_num`, then lowest index.
pub fn choose_split_index(slots: &[InstanceSlot]) -> Option<usize> {
    let max_size = slots.iter().map(|s| s.range().size()).max()?;

    let mut best: Option<usize> = None;
    for (idx, slot) in slots.iter().enumerate() {
        if slot.range().size().abs_diff(max_size) > 1 {
            continue;
        }
        match best {
            Some(b) if slots[b].workload_num >= slot.workload_num => {}
            _ => best = Some(idx),
        }
    }
    best
}

/// Compute the key that cuts `range` in two.
///
/// The left half is never smaller than the right one: interior and top
/// ranges round the midpoint up, the first range already counts key `0`.
pub fn split_key(range: KeyRange) -> PartitionResult<i64> {
    let span = range.upper - range.lower;
    if span <= 1 {
        return Err(PartitionError::NoSpaceToSplit {
            lower: range.lower,
            upper: range.upper,
        });
    }

    let space = if range.lower != KEY_MIN { span + 1 } else { span };
    Ok(range.lower + space / 2)
}

/// Choose the range to split in a sorted, assigned roster and the new key.
pub fn split_point(slots: &[InstanceSlot]) -> PartitionResult<Split> {
    let index = choose_split_index(slots).ok_or(PartitionError::EmptyRoster)?;
    let key = split_key(slots[index].range())?;
    Ok(Split { index, key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::KEY_MAX;
    use crate::slot::sort_and_assign;

    fn roster(entries: &[(i64, i32)]) -> Vec<InstanceSlot> {
        let mut slots: Vec<_> = entries
            .iter()
            .enumerate()
            .map(|(i, (k, w))| InstanceSlot::new(format!("i{i}"), *k, *w, false))
            .collect();
        sort_and_assign(&mut slots);
        slots
    }

    #[test]
    fn test_split_solo_instance() {
        let split = split_point(&roster(&[(KEY_MAX, 0)])).unwrap();
        assert_eq!(split.index, 0);
        assert_eq!(split.key, (1i64 << 62) - 1);
    }

    #[test]
    fn test_split_picks_larger_top_range() {
        let split = split_point(&roster(&[(10_000, 0), (KEY_MAX, 0)])).unwrap();
        assert_eq!(split.index, 1);
        assert_eq!(split.key, 10_000 + (KEY_MAX - 10_000 + 1) / 2);
    }

    #[test]
    fn test_split_ties_broken_by_workload() {
        // [0,9] and (9,19] both hold 10 keys
        let split = split_point(&roster(&[(9, 1), (19, 7), (29, 3), (KEY_MAX, 0)]));
        // top range is far larger regardless of workload
        assert_eq!(split.unwrap().index, 3);

        let split = split_point(&roster(&[(9, 1), (19, 7), (29, 3)])).unwrap();
        assert_eq!(split.index, 1);
        assert_eq!(split.key, 14);
    }

    #[test]
    fn test_split_sizes_within_one_are_equal() {
        // sizes 11 and 10: treated as equal, workload decides
        let split = split_point(&roster(&[(10, 0), (20, 5)])).unwrap();
        assert_eq!(split.index, 1);
    }

    #[test]
    fn test_split_final_tie_is_leftmost() {
        let split = split_point(&roster(&[(9, 2), (19, 2), (29, 2)])).unwrap();
        assert_eq!(split.index, 0);
        assert_eq!(split.key, 4);
    }

    #[test]
    fn test_split_odd_interior_range_favours_left() {
        // (10, 13]: keys 11,12,13 -> left (10,12], right (12,13]
        assert_eq!(split_key(KeyRange::new(10, 13)).unwrap(), 12);
        // [0, 3]: keys 0..=3 -> left [0,1], right (1,3]
        assert_eq!(split_key(KeyRange::new(0, 3)).unwrap(), 1);
    }

    #[test]
    fn test_no_space_to_split() {
        assert_eq!(
            split_key(KeyRange::new(10, 11)),
            Err(PartitionError::NoSpaceToSplit {
                lower: 10,
                upper: 11
            })
        );
        assert!(split_key(KeyRange::new(0, 1)).is_err());
        assert!(split_key(KeyRange::new(10, 12)).is_ok());
    }

    #[test]
    fn test_empty_roster() {
        assert_eq!(split_point(&[]), Err(PartitionError::EmptyRoster));
    }
}
