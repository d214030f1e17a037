//! SCF Controller Manager
//!
//! Hosts sharded controllers. Every controller type's key space is split
//! among its live instances; each process runs one instance per hosted type.
//!
//! ## Architecture
//!
//! - **Instance Manager**: process-wide roster of controller instances,
//!   kept current by a registry list + watch
//! - **Controller Base**: per-instance key range, lock/unlock hand-off with
//!   peers, and the gate every work item passes through
//! - **Runner**: worker pool and health reporter on top of a base
//!
//! ```text
//! registry ──watch──► ControllerInstanceManager ──notify(type)──► ControllerBase
//!                                                                     │
//!                      WorkQueue ──► workers ──begin_work_item────────┘
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod instance_manager;

pub use controller::{
    BaseConfig, ControllerBase, ControllerRunner, ControllerState, FilterBound, OutOfRangePolicy,
    Reconciler, RunnerConfig,
};
pub use error::{ControllerError, ManagerError};
pub use instance_manager::{ControllerInstanceManager, InstanceMap, ManagerConfig};
