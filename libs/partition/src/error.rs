use thiserror::Error;

/// Result type for partition operations.
pub type PartitionResult<T> = Result<T, PartitionError>;

/// Partitioning errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// The chosen range is too narrow to hand half of it to a joiner.
    #[error("no space to split range ({lower}, {upper}]")]
    NoSpaceToSplit { lower: i64, upper: i64 },

    /// There is no existing range to split.
    #[error("cannot split an empty roster")]
    EmptyRoster,
}
