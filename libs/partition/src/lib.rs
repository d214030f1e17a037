//! Key range algebra for controller sharding.
//!
//! The workload key space is `[0, i64::MAX]`. Every live controller instance
//! of a type owns the half-open interval `(lowerbound_key, controller_key]`,
//! where its lower bound is the key of the instance immediately below it.
//! The lowest instance is closed on the left so that key `0` has an owner:
//! its range is `[0, controller_key]`.
//!
//! # Invariants
//!
//! - Sorted by `controller_key`, instances tile the space with no gaps and no
//!   overlap once the highest key is pinned to `i64::MAX`.
//! - A split never produces a left half smaller than its right half.
//! - All functions here are pure; callers own locking and persistence.

mod change;
mod error;
mod range;
mod slot;
mod split;

pub use change::RangeChange;
pub use error::{PartitionError, PartitionResult};
pub use range::{KeyRange, KEY_MAX, KEY_MIN};
pub use slot::{assign_ranges, owner_of, position_of, sort_and_assign, InstanceSlot};
pub use split::{choose_split_index, split_key, split_point, Split};
