//! Inputs and outcomes of assignment resolution.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::experiment::{Condition, Experiment, Partition};
use crate::types::{ConditionId, ExperimentId, PartitionId, UserId};

/// The user being resolved, with the groups they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentUser {
    pub id: UserId,
    /// Group type to group id, e.g. `"class" -> "c-42"`
    #[serde(default)]
    pub groups: BTreeMap<String, String>,
}

impl ExperimentUser {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            groups: BTreeMap::new(),
        }
    }

    /// Add a group membership.
    #[must_use]
    pub fn with_group(mut self, group_type: impl Into<String>, group_id: impl Into<String>) -> Self {
        self.groups.insert(group_type.into(), group_id.into());
        self
    }

    pub fn group(&self, group_type: &str) -> Option<&str> {
        self.groups.get(group_type).map(String::as_str)
    }
}

/// Where an assigned condition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    /// Preview user's own override
    Preview,
    /// Manual pin for a production user
    Explicit,
    /// Persisted weighted draw
    Randomized,
    /// Forced by the `assign` post-experiment rule
    PostExperiment,
}

/// Why nobody is assigned. A normal outcome, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoAssignmentReason {
    /// The experiment is not scoped to the requested context
    ContextMismatch,
    /// Preview user without an override for this experiment
    PreviewWithoutOverride,
    /// Inactive, scheduled, or demo without an override
    NotRunning,
    /// Group assignment and the user has no group of the required type
    NoGroupMembership,
    /// Every condition has zero weight
    NoEligibleCondition,
    /// Enrollment is complete and the user was never assigned
    EnrollmentComplete,
    /// Enrollment is complete and the experiment reverts to default
    RevertedToDefault,
    /// The condition vanished under a concurrent edit twice in a row
    Stale,
}

/// Condition summary handed to the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedCondition {
    pub id: ConditionId,
    pub code: String,
    pub two_character_id: String,
}

impl From<&Condition> for AssignedCondition {
    fn from(condition: &Condition) -> Self {
        Self {
            id: condition.id,
            code: condition.code.clone(),
            two_character_id: condition.two_character_id.clone(),
        }
    }
}

/// A condition assigned at a decision point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionAssignment {
    pub experiment_id: ExperimentId,
    pub partition_id: PartitionId,
    pub exp_point: String,
    pub exp_id: Option<String>,
    /// The partition's two-character id
    pub two_character_id: String,
    pub condition: AssignedCondition,
    pub source: AssignmentSource,
}

impl ConditionAssignment {
    pub(crate) fn new(
        experiment: &Experiment,
        partition: &Partition,
        condition: &Condition,
        source: AssignmentSource,
    ) -> Self {
        Self {
            experiment_id: experiment.id,
            partition_id: partition.id.clone(),
            exp_point: partition.exp_point.clone(),
            exp_id: partition.exp_id.clone(),
            two_character_id: partition.two_character_id.clone(),
            condition: condition.into(),
            source,
        }
    }
}

/// Outcome of resolving one decision point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Assigned(ConditionAssignment),
    NoAssignment { reason: NoAssignmentReason },
}

impl Resolution {
    pub(crate) fn none(reason: NoAssignmentReason) -> Self {
        Self::NoAssignment { reason }
    }

    pub fn assignment(&self) -> Option<&ConditionAssignment> {
        match self {
            Self::Assigned(assignment) => Some(assignment),
            Self::NoAssignment { .. } => None,
        }
    }

    /// Code of the assigned condition, if any.
    pub fn condition_code(&self) -> Option<&str> {
        self.assignment().map(|a| a.condition.code.as_str())
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned(_))
    }
}

/// Every eligible decision point of a context, assigned or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPointAssignment {
    pub experiment_id: ExperimentId,
    pub partition_id: PartitionId,
    pub exp_point: String,
    pub exp_id: Option<String>,
    pub two_character_id: String,
    pub condition: Option<AssignedCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AssignmentSource>,
}

impl DecisionPointAssignment {
    pub(crate) fn new(partition: &Partition, resolution: &Resolution) -> Self {
        let assignment = resolution.assignment();
        Self {
            experiment_id: partition.experiment_id,
            partition_id: partition.id.clone(),
            exp_point: partition.exp_point.clone(),
            exp_id: partition.exp_id.clone(),
            two_character_id: partition.two_character_id.clone(),
            condition: assignment.map(|a| a.condition.clone()),
            source: assignment.map(|a| a.source),
        }
    }
}

/// A persisted randomized assignment.
///
/// Unique on `(selection_key, experiment_id)`; once written it is returned
/// verbatim until the condition or partition it depends on is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub selection_key: String,
    pub experiment_id: ExperimentId,
    /// Set for partition-scoped keys only
    pub partition_id: Option<PartitionId>,
    pub condition_id: ConditionId,
    pub created_at: DateTime<Utc>,
}

/// A user reaching a decision point, recorded when asked to mark visits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPointVisit {
    pub user_id: UserId,
    pub experiment_id: ExperimentId,
    pub partition_id: PartitionId,
    pub condition_id: Option<ConditionId>,
    pub visited_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_groups_are_looked_up_by_type() {
        let user = ExperimentUser::new("u1").with_group("class", "c-1");
        assert_eq!(user.group("class"), Some("c-1"));
        assert_eq!(user.group("school"), None);
    }

    #[test]
    fn no_assignment_serializes_with_reason() {
        let resolution = Resolution::none(NoAssignmentReason::PreviewWithoutOverride);
        let json = serde_json::to_value(&resolution).unwrap();
        assert_eq!(json["outcome"], "no_assignment");
        assert_eq!(json["reason"], "preview_without_override");
        assert!(resolution.condition_code().is_none());
    }
}
