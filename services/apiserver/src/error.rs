use scf_registry::RegistryError;
use thiserror::Error;

/// Endpoint reconciler errors.
#[derive(Debug, Error)]
pub enum EndpointReconcileError {
    /// No live lease in our service group; writing would erase every address.
    #[error("no API server leases listed for service group '{service_group_id}', refusing to erase endpoints")]
    NoLeases { service_group_id: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl EndpointReconcileError {
    /// Whether the next pass may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoLeases { .. } => true,
            Self::Registry(e) => e.is_transient() || e.is_conflict(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EndpointReconcileError>;
