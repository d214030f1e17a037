//! Sharded controller base and the worker pool that drives reconcilers.
//!
//! A controller registers itself with a key taken from the current roster,
//! then follows roster changes published by the instance manager:
//!
//! ```text
//!   Init ──► Active ◄──────────┐
//!    │         │ range shrank  │ drained
//!    ▼         ▼               │
//!  Locked     Wait ────────────┘
//!    │ unlocked by successor
//!    └──────► Active
//! ```
//!
//! Any state moves to `Error` when the instance disappears from the roster.

mod base;
mod filter;
mod health;
mod state;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use base::{BaseConfig, ControllerBase, InFlightGuard, WorkAdmission};
pub use filter::FilterBound;
pub use health::{report_once, run_health_loop};
pub use state::{observe, ControllerState, Observation, Roster, Step};
pub use worker::{
    ControllerRunner, ErrorHandler, OutOfRangePolicy, Reconciler, RequeueOnError, RunnerConfig,
};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
