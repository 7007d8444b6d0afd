//! Error types for assignment storage.

use thiserror::Error;

use crate::types::ExperimentId;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database error from libSQL.
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    /// Filesystem error preparing a local database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid data in the database.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Experiment not found.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    /// An experiment with this id already exists.
    #[error("experiment already exists: {0}")]
    AlreadyExists(ExperimentId),

    /// The stored version moved on since the transaction was planned.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// A partition two-character id is owned by another experiment.
    #[error("two-character id {two_character_id} is owned by experiment {experiment_id}")]
    DuplicateTwoCharId {
        two_character_id: String,
        experiment_id: ExperimentId,
    },

    /// Another unique constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
}
