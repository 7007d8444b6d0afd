//! Error types for upgrade-core

use thiserror::Error;

use crate::storage;
use crate::types::{ConditionId, ExperimentId, UserId};
use crate::validation::{self, Violation};

/// Entity that could not be found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("experiment {0}")]
    Experiment(ExperimentId),

    #[error("partition with two-character id {0:?}")]
    Partition(String),

    #[error("condition {condition} in experiment {experiment}")]
    Condition {
        experiment: ExperimentId,
        condition: ConditionId,
    },

    #[error("preview user {0}")]
    PreviewUser(UserId),
}

/// Error type for assignment platform operations.
///
/// A user who receives no condition is not an error; see
/// [`Resolution::NoAssignment`](crate::Resolution::NoAssignment).
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before anything was written
    #[error("validation failed: {}", validation::join(.0))]
    Validation(Vec<Violation>),

    #[error("not found: {0}")]
    NotFound(NotFound),

    /// The experiment changed since the edit was based on it; retry
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// Storage failure, propagated unmodified
    #[error("storage error: {0}")]
    Storage(storage::Error),
}

impl Error {
    /// Wrap violations, or `Ok` when there are none.
    pub(crate) fn check(violations: Vec<Violation>) -> Result<()> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Self::Validation(violations))
        }
    }

    /// The violations carried by a validation error.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation(violations) => violations,
            _ => &[],
        }
    }
}

impl From<NotFound> for Error {
    fn from(err: NotFound) -> Self {
        Self::NotFound(err)
    }
}

impl From<storage::Error> for Error {
    fn from(err: storage::Error) -> Self {
        match err {
            storage::Error::VersionConflict { expected, actual } => {
                Self::Conflict { expected, actual }
            }
            storage::Error::ExperimentNotFound(id) => Self::NotFound(NotFound::Experiment(id)),
            storage::Error::DuplicateTwoCharId {
                two_character_id,
                experiment_id,
            } => Self::Validation(vec![Violation::DuplicateTwoCharId {
                value: two_character_id,
                owner: Some(experiment_id),
            }]),
            other => Self::Storage(other),
        }
    }
}

/// Result type alias for upgrade-core operations
pub type Result<T> = std::result::Result<T, Error>;
