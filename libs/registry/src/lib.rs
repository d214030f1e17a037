//! Registry client for the sharded controller framework.
//!
//! The registry is a linearizable store with list, watch and optimistic
//! concurrency. This crate defines the objects the framework keeps there and
//! the store traits the rest of the workspace programs against:
//!
//! - [`ControllerInstanceStore`]: membership records per controller type
//! - [`LeaseStore`]: TTL leases held by API servers
//! - [`EndpointsStore`]: the bootstrap `Endpoints` object
//!
//! Two implementations are provided: [`MemoryRegistry`] for development and
//! tests, and [`PgRegistry`] backed by Postgres.

mod call;
mod db;
mod error;
mod memory;
mod store;
mod types;

pub use call::{retry_transient, with_timeout};
pub use db::{DbConfig, PgRegistry};
pub use error::{RegistryError, RegistryResult};
pub use memory::{MemoryRegistry, DEFAULT_EVENT_LOG_CAPACITY};
pub use store::{
    ControllerInstanceStore, EndpointsStore, InstanceWatch, LeaseStore, Registry,
};
pub use types::{ControllerInstance, InstanceList, Lease, WatchEvent, WatchEventType};
