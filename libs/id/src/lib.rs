//! # scf-id
//!
//! Identifiers shared by every process taking part in controller sharding.
//!
//! ## Instance names
//!
//! Each controller instance registers under a globally unique name built
//! from its controller type and a prefixed ULID, e.g.
//! `replicaset-ci_01HV4Z2WQXKJNM8GPQY6VBKC3D`. Names are never reused: a
//! restarted process always registers a fresh one.
//!
//! ## Workload keys
//!
//! Workloads are placed on the 63-bit key space by hashing their UUID with
//! [`workload_key`]. The function is part of the wire contract; every process
//! must compute identical keys for the same object.

mod error;
mod hash;
mod types;

pub use error::IdError;
pub use hash::workload_key;
pub use types::{instance_name, parse_instance_name, InstanceId};

/// Re-export uuid so callers hash the same type this crate does
pub use uuid::Uuid;
