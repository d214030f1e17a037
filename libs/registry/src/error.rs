use std::time::Duration;

use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Optimistic concurrency failure: the stored object has moved on.
    #[error("conflict updating {kind} '{name}': expected resource version {expected}, stored {actual}")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        actual: u64,
    },

    /// The requested resource version is older than the retained history.
    #[error("resource version {requested} is too old (oldest retained: {oldest})")]
    Expired { requested: u64, oldest: u64 },

    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("field '{field}' of {kind} '{name}' is immutable")]
    ImmutableField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }

    /// Errors worth retrying with backoff without re-reading state first.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Database(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn conflict() -> RegistryError {
        RegistryError::Conflict {
            kind: "ControllerInstance",
            name: "a".into(),
            expected: 1,
            actual: 2,
        }
    }

    #[rstest]
    #[case::timeout(RegistryError::Timeout(Duration::from_secs(1)), true)]
    #[case::unavailable(RegistryError::Unavailable("down".into()), true)]
    #[case::pool_timeout(RegistryError::Database(sqlx::Error::PoolTimedOut), true)]
    #[case::conflict(conflict(), false)]
    #[case::expired(RegistryError::Expired { requested: 1, oldest: 5 }, false)]
    #[case::row_not_found(RegistryError::Database(sqlx::Error::RowNotFound), false)]
    fn test_is_transient(#[case] err: RegistryError, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient);
    }

    #[test]
    fn test_error_classification() {
        assert!(conflict().is_conflict());
        assert!(RegistryError::AlreadyExists {
            kind: "ControllerInstance",
            name: "a".into()
        }
        .is_already_exists());
        assert!(RegistryError::Expired { requested: 1, oldest: 5 }.is_expired());
        assert!(RegistryError::NotFound {
            kind: "Endpoints",
            name: "kubernetes".into()
        }
        .is_not_found());
    }
}
