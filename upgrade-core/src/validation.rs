//! Validation violations reported when experiments and overrides are written.
//!
//! Each input schema exposes a `validate()` that returns every violation it
//! finds rather than stopping at the first one. An empty list means valid.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ExperimentId, PartitionId};

/// A single rule broken by an input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A two-character id is not exactly two ASCII alphanumerics.
    InvalidTwoCharId { value: String },
    /// A two-character id is already taken.
    ///
    /// `owner` is the experiment holding it when the collision is with stored data.
    DuplicateTwoCharId {
        value: String,
        owner: Option<ExperimentId>,
    },
    /// A composite partition id is declared twice, or held by another experiment.
    DuplicatePartitionId { id: PartitionId },
    /// A supplied partition id disagrees with its `expId`/`expPoint`.
    PartitionIdMismatch {
        supplied: PartitionId,
        expected: PartitionId,
    },
    /// An enrolling experiment has no conditions.
    NoConditions,
    /// A condition weight is outside 0..=100.
    InvalidWeight { code: String, weight: u32 },
    /// A required field is empty.
    EmptyField { field: &'static str },
    /// An experiment is not scoped to any context.
    NoContext,
    /// Group assignment or group consistency without a group type.
    MissingGroupType,
    /// Group consistency requested for individually assigned experiments.
    GroupConsistencyRequiresGroupUnit,
    /// `assign` post-experiment rule without a valid target condition.
    InvalidRevertTarget { value: Option<String> },
    /// The same experiment appears twice in one override set.
    DuplicateOverride { experiment_id: ExperimentId },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTwoCharId { value } => {
                write!(f, "two-character id {value:?} must be exactly two alphanumerics")
            }
            Self::DuplicateTwoCharId {
                value,
                owner: Some(owner),
            } => write!(f, "two-character id {value:?} is used by experiment {owner}"),
            Self::DuplicateTwoCharId { value, owner: None } => {
                write!(f, "two-character id {value:?} is used more than once")
            }
            Self::DuplicatePartitionId { id } => write!(f, "partition {id} is declared twice"),
            Self::PartitionIdMismatch { supplied, expected } => {
                write!(f, "partition id {supplied} does not match {expected}")
            }
            Self::NoConditions => write!(f, "an enrolling experiment needs at least one condition"),
            Self::InvalidWeight { code, weight } => {
                write!(f, "condition {code:?} has weight {weight}, expected 0..=100")
            }
            Self::EmptyField { field } => write!(f, "{field} must not be empty"),
            Self::NoContext => write!(f, "experiment must be scoped to at least one context"),
            Self::MissingGroupType => write!(f, "group assignment requires a group type"),
            Self::GroupConsistencyRequiresGroupUnit => {
                write!(f, "group consistency requires group assignment")
            }
            Self::InvalidRevertTarget { value: Some(value) } => {
                write!(f, "revert target {value:?} is not a condition of the experiment")
            }
            Self::InvalidRevertTarget { value: None } => {
                write!(f, "the assign rule requires a revert target")
            }
            Self::DuplicateOverride { experiment_id } => {
                write!(f, "experiment {experiment_id} is assigned more than once")
            }
        }
    }
}

/// Maximum weight of a single condition.
pub const MAX_ASSIGNMENT_WEIGHT: u32 = 100;

/// Whether `value` is a well-formed two-character id.
pub fn is_two_char_id(value: &str) -> bool {
    value.len() == 2 && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Push an `EmptyField` violation when `value` is blank.
pub(crate) fn require_non_empty(
    violations: &mut Vec<Violation>,
    field: &'static str,
    value: &str,
) {
    if value.trim().is_empty() {
        violations.push(Violation::EmptyField { field });
    }
}

/// Render a list of violations as one line.
pub(crate) fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
