//! Override sources that take precedence over randomized allocation.
//!
//! - [`ExplicitAssignments`] pins a production user to a condition.
//! - [`PreviewUsers`] manages test identities that only ever see their own
//!   preview-scoped assignments.
//!
//! Both write [`ExplicitAssignment`] rows, told apart by [`OverrideScope`].

mod explicit;
mod preview;

pub use explicit::ExplicitAssignments;
pub use preview::PreviewUsers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AssignmentId, ConditionId, ExperimentId, UserId};

/// Which override source owns an explicit assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    /// Manual pin for a production user
    Individual,
    /// Owned by a preview user
    Preview,
}

impl OverrideScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Preview => "preview",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(Self::Individual),
            "preview" => Some(Self::Preview),
            _ => None,
        }
    }
}

/// A user pinned to a condition of an experiment.
///
/// At most one row exists per `(user_id, experiment_id, scope)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplicitAssignment {
    pub id: AssignmentId,
    pub user_id: UserId,
    pub experiment_id: ExperimentId,
    pub condition_id: ConditionId,
    pub scope: OverrideScope,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A test identity excluded from randomization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewUser {
    pub id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Preview-scoped assignments, loaded on read
    #[serde(default)]
    pub assignments: Vec<ExplicitAssignment>,
}

/// One entry of a preview user's desired assignment set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewAssignmentSpec {
    /// Present for assignments that already exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<AssignmentId>,
    pub experiment_id: ExperimentId,
    pub condition_id: ConditionId,
}
