//! OBLIVION - Custom Error Types
//! Defines the error hierarchy for the partition merge engine.

use thiserror::Error;

use crate::schema::{ColumnKind, SchemaVersion};
use crate::types::ColumnId;

/// Custom Result type for the partition engine.
pub type Result<T> = std::result::Result<T, PartitionError>;

/// Error types for the partition merge engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// A new entry could not be constructed during a merge.
    /// The merge is always rolled back before this is surfaced.
    #[error("Allocation failure while constructing {0}")]
    AllocationFailure(&'static str),

    /// The fragment was produced under a different schema version.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        found: SchemaVersion,
    },

    /// The fragment cannot be upgraded to the destination schema.
    #[error("Incompatible schema: {0}")]
    IncompatibleSchema(String),

    /// A cell references a column the schema does not define.
    #[error("Unknown {kind:?} column id {id}")]
    UnknownColumn { kind: ColumnKind, id: ColumnId },

    /// Internal consistency check failed (programming error).
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Query result encoding/decoding errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
