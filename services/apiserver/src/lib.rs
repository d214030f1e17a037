//! SCF API server endpoint reconciler
//!
//! Keeps the bootstrap `kubernetes` endpoints listing every live API server
//! of a service group. Each server renews a TTL lease in the registry and
//! rewrites only its own group's subset.

pub mod config;
pub mod error;
pub mod reconciler;

pub use error::{EndpointReconcileError, Result};
pub use reconciler::{LeaseEndpointReconciler, ReconcileOutcome, ReconcilerConfig};
