//! Bootstrap `Endpoints` model.
//!
//! One `Endpoints` object carries a subset per service group. Each API server
//! only ever rewrites the subsets of its own group; [`repack`] canonicalizes
//! those and leaves every other group's subsets untouched.

mod repack;
mod types;

pub use repack::{repack, sort_subsets};
pub use types::{
    AddressKey, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference,
    Protocol,
};
