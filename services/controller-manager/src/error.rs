//! Error types for the instance manager and controller base.

use scf_partition::PartitionError;
use scf_registry::RegistryError;
use thiserror::Error;

/// Controller instance manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A manager is already running against this registry client.
    #[error("a controller instance manager is already running for this registry client")]
    AlreadyRunning,

    /// An immutable field changed on a stored instance.
    #[error("immutable field '{field}' of instance '{name}' changed from '{old}' to '{new}'")]
    ImmutableField {
        name: String,
        field: &'static str,
        old: String,
        new: String,
    },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl ManagerError {
    /// Whether the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::ImmutableField { .. })
    }
}

/// Controller base errors. Everything except `Registry` is fatal.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Self no longer present in the membership snapshot.
    #[error("instance '{name}' lost its membership")]
    LostMembership { name: String },

    /// Initial registration failed.
    #[error("failed to register instance '{name}': {source}")]
    Registration {
        name: String,
        #[source]
        source: RegistryError,
    },

    /// No range could be split for a joiner.
    #[error("cannot pick a key for a new instance: {0}")]
    Split(#[from] PartitionError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("instance manager error: {0}")]
    Manager(#[from] ManagerError),

    /// The instance manager stopped publishing notifications.
    #[error("controller stopped: {0}")]
    Stopped(String),
}

impl ControllerError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Registry(e) => !e.is_transient() && !e.is_conflict(),
            Self::Manager(e) => e.is_fatal(),
            _ => true,
        }
    }
}
