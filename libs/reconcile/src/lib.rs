//! Reconciliation loop primitives.
//!
//! This library provides the pieces every sharded reconciler drives its
//! work through:
//!
//! - **Work queue**: FIFO with per-key dedup; an item is never handed to two
//!   workers at once, and re-adds during processing are deferred.
//! - **Rate limiting**: failed items come back after an exponential,
//!   per-item backoff.
//! - **Errors**: a shared error type reconcilers return per work item.
//!
//! # Invariants
//!
//! - Reconcilers are idempotent, so at-least-once delivery is sufficient
//! - `get` never returns an item that is still being processed
//! - After `shut_down`, `get` returns `None` and blocked workers wake up

mod backoff;
mod error;
mod queue;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use error::{ReconcileError, ReconcileResult};
pub use queue::WorkQueue;

/// Default number of requeues before an item is forgotten.
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Default per-item processing timeout.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(60);
