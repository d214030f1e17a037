use thiserror::Error;

/// Instance id and name parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty instance id")]
    Empty,

    #[error("instance id prefix is '{actual}', expected '{expected}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("instance id has no '_' separator")]
    MissingSeparator,

    #[error("instance id carries an invalid ULID: {0}")]
    InvalidUlid(String),

    /// The instance name does not carry the expected controller type.
    #[error("instance name '{name}' does not belong to controller type '{controller_type}'")]
    ControllerTypeMismatch {
        name: String,
        controller_type: String,
    },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
