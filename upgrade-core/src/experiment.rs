//! Experiment aggregate: the experiment, its conditions and its partitions.
//!
//! Stored entities carry identity, a version counter and audit timestamps.
//! The `*Spec` types are the input documents accepted by the lifecycle
//! manager; an absent `id` on a child spec means "create".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConditionId, ExperimentId, PartitionId};
use crate::validation::{
    MAX_ASSIGNMENT_WEIGHT, Violation, is_two_char_id, require_non_empty,
};

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExperimentState {
    /// Defined but switched off
    Inactive,
    /// Visible to overrides only; nobody is randomized
    Demo,
    /// Waiting for its start date
    Scheduled,
    /// Actively assigning users
    Enrolling,
    /// No new enrollments; the post-experiment rule applies
    EnrollmentComplete,
}

impl ExperimentState {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Demo => "demo",
            Self::Scheduled => "scheduled",
            Self::Enrolling => "enrolling",
            Self::EnrollmentComplete => "enrollmentComplete",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(Self::Inactive),
            "demo" => Some(Self::Demo),
            "scheduled" => Some(Self::Scheduled),
            "enrolling" => Some(Self::Enrolling),
            "enrollmentComplete" => Some(Self::EnrollmentComplete),
            _ => None,
        }
    }
}

/// What users see once enrollment is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostExperimentRule {
    /// Users keep the condition they were given
    Continue,
    /// Everybody falls back to the host application's default
    RevertToDefault,
    /// Everybody gets the experiment's designated condition
    Assign,
}

impl PostExperimentRule {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::RevertToDefault => "revertToDefault",
            Self::Assign => "assign",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(Self::Continue),
            "revertToDefault" => Some(Self::RevertToDefault),
            "assign" => Some(Self::Assign),
            _ => None,
        }
    }
}

/// Who receives a randomized condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssignmentUnit {
    Individual,
    Group,
}

impl AssignmentUnit {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Group => "group",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(Self::Individual),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Granularity at which a once-given assignment is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsistencyRule {
    /// A user keeps their condition across every decision point
    Individual,
    /// A group keeps its condition across every decision point
    Group,
    /// Each decision point is allocated on its own
    Experiment,
}

impl ConsistencyRule {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Group => "group",
            Self::Experiment => "experiment",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(Self::Individual),
            "group" => Some(Self::Group),
            "experiment" => Some(Self::Experiment),
            _ => None,
        }
    }
}

/// One arm of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: ConditionId,
    pub experiment_id: ExperimentId,
    pub code: String,
    pub description: String,
    /// Relative selection weight (0-100); weights need not sum to 100
    pub assignment_weight: u32,
    /// Short id, unique within the experiment
    pub two_character_id: String,
    /// Position in the experiment document
    pub order: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Condition {
    /// Whether the mutable fields differ from `spec`.
    pub(crate) fn differs_from(&self, spec: &ConditionSpec, order: u32) -> bool {
        self.code != spec.code
            || self.description != spec.description
            || self.assignment_weight != spec.assignment_weight
            || self.two_character_id != spec.two_character_id
            || self.order != order
    }
}

/// A decision point inside the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub id: PartitionId,
    pub experiment_id: ExperimentId,
    pub exp_point: String,
    pub exp_id: Option<String>,
    /// Short id, unique across every experiment
    pub two_character_id: String,
    pub description: String,
    pub order: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Partition {
    pub(crate) fn differs_from(&self, spec: &PartitionSpec, order: u32) -> bool {
        self.description != spec.description
            || self.two_character_id != spec.two_character_id
            || self.order != order
    }
}

/// Experiment row without its children.
///
/// This is what the experiments table holds; conditions and partitions live
/// in their own tables and are attached on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRow {
    pub id: ExperimentId,
    pub name: String,
    pub description: String,
    pub context: Vec<String>,
    pub state: ExperimentState,
    pub post_experiment_rule: PostExperimentRule,
    pub revert_to: Option<ConditionId>,
    pub assignment_unit: AssignmentUnit,
    pub consistency_rule: ConsistencyRule,
    pub group_type: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExperimentRow {
    /// Attach children, ordering them as they were declared.
    #[must_use]
    pub fn into_experiment(
        self,
        mut conditions: Vec<Condition>,
        mut partitions: Vec<Partition>,
    ) -> Experiment {
        conditions.sort_by_key(|c| c.order);
        partitions.sort_by_key(|p| p.order);
        Experiment {
            id: self.id,
            name: self.name,
            description: self.description,
            context: self.context,
            state: self.state,
            post_experiment_rule: self.post_experiment_rule,
            revert_to: self.revert_to,
            assignment_unit: self.assignment_unit,
            consistency_rule: self.consistency_rule,
            group_type: self.group_type,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            conditions,
            partitions,
        }
    }
}

/// An experiment with its conditions and partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub description: String,
    /// Host contexts this experiment is scoped to
    pub context: Vec<String>,
    pub state: ExperimentState,
    pub post_experiment_rule: PostExperimentRule,
    /// Condition forced by [`PostExperimentRule::Assign`]
    pub revert_to: Option<ConditionId>,
    pub assignment_unit: AssignmentUnit,
    pub consistency_rule: ConsistencyRule,
    /// Group type whose membership drives group assignment
    pub group_type: Option<String>,
    /// Optimistic concurrency counter
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub conditions: Vec<Condition>,
    pub partitions: Vec<Partition>,
}

impl Experiment {
    /// The experiment row without children.
    #[must_use]
    pub fn row(&self) -> ExperimentRow {
        ExperimentRow {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            context: self.context.clone(),
            state: self.state,
            post_experiment_rule: self.post_experiment_rule,
            revert_to: self.revert_to,
            assignment_unit: self.assignment_unit,
            consistency_rule: self.consistency_rule,
            group_type: self.group_type.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn condition(&self, id: ConditionId) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    pub fn partition_by_two_char_id(&self, two_char_id: &str) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.two_character_id == two_char_id)
    }

    /// Whether the experiment is scoped to `context`.
    pub fn in_context(&self, context: &str) -> bool {
        self.context.iter().any(|c| c == context)
    }
}

/// Input document for a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    /// Present for conditions that already exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ConditionId>,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub assignment_weight: u32,
    pub two_character_id: String,
}

impl ConditionSpec {
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        require_non_empty(&mut violations, "condition code", &self.code);
        if self.assignment_weight > MAX_ASSIGNMENT_WEIGHT {
            violations.push(Violation::InvalidWeight {
                code: self.code.clone(),
                weight: self.assignment_weight,
            });
        }
        if !is_two_char_id(&self.two_character_id) {
            violations.push(Violation::InvalidTwoCharId {
                value: self.two_character_id.clone(),
            });
        }
        violations
    }
}

/// Input document for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSpec {
    /// Present for partitions that already exist; must match the composite id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PartitionId>,
    pub exp_point: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_id: Option<String>,
    #[serde(default)]
    pub description: String,
    pub two_character_id: String,
}

impl PartitionSpec {
    /// Composite id derived from `expId` and `expPoint`.
    #[must_use]
    pub fn composite_id(&self) -> PartitionId {
        PartitionId::compose(self.exp_id.as_deref(), &self.exp_point)
    }

    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        require_non_empty(&mut violations, "expPoint", &self.exp_point);
        if !is_two_char_id(&self.two_character_id) {
            violations.push(Violation::InvalidTwoCharId {
                value: self.two_character_id.clone(),
            });
        }
        if let Some(supplied) = &self.id {
            let expected = self.composite_id();
            if *supplied != expected {
                violations.push(Violation::PartitionIdMismatch {
                    supplied: supplied.clone(),
                    expected,
                });
            }
        }
        violations
    }
}

/// Input document for an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub context: Vec<String>,
    pub state: ExperimentState,
    pub post_experiment_rule: PostExperimentRule,
    /// Two-character id of the condition forced by the `assign` rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_to: Option<String>,
    pub assignment_unit: AssignmentUnit,
    pub consistency_rule: ConsistencyRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_type: Option<String>,
    /// Version the edit was based on; checked on update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
}

impl ExperimentSpec {
    /// Experiment-level rules. Children are checked by their registries.
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        require_non_empty(&mut violations, "experiment name", &self.name);
        if self.context.iter().all(|c| c.trim().is_empty()) {
            violations.push(Violation::NoContext);
        }
        let needs_group = self.assignment_unit == AssignmentUnit::Group
            || self.consistency_rule == ConsistencyRule::Group;
        if needs_group && self.group_type.as_deref().is_none_or(|g| g.trim().is_empty()) {
            violations.push(Violation::MissingGroupType);
        }
        if self.consistency_rule == ConsistencyRule::Group
            && self.assignment_unit == AssignmentUnit::Individual
        {
            violations.push(Violation::GroupConsistencyRequiresGroupUnit);
        }
        if self.post_experiment_rule == PostExperimentRule::Assign {
            match &self.revert_to {
                None => violations.push(Violation::InvalidRevertTarget { value: None }),
                Some(target) if !self.conditions.iter().any(|c| &c.two_character_id == target) => {
                    violations.push(Violation::InvalidRevertTarget {
                        value: Some(target.clone()),
                    });
                }
                Some(_) => {}
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ExperimentSpec {
        ExperimentSpec {
            name: "hint-layout".to_string(),
            description: String::new(),
            context: vec!["home".to_string()],
            state: ExperimentState::Enrolling,
            post_experiment_rule: PostExperimentRule::Continue,
            revert_to: None,
            assignment_unit: AssignmentUnit::Individual,
            consistency_rule: ConsistencyRule::Individual,
            group_type: None,
            version: None,
            conditions: vec![ConditionSpec {
                id: None,
                code: "A".to_string(),
                description: String::new(),
                assignment_weight: 50,
                two_character_id: "CA".to_string(),
            }],
            partitions: vec![],
        }
    }

    #[test]
    fn state_round_trips_through_db_strings() {
        for state in [
            ExperimentState::Inactive,
            ExperimentState::Demo,
            ExperimentState::Scheduled,
            ExperimentState::Enrolling,
            ExperimentState::EnrollmentComplete,
        ] {
            assert_eq!(ExperimentState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ExperimentState::parse("running"), None);
    }

    #[test]
    fn state_serializes_in_camel_case() {
        let json = serde_json::to_string(&ExperimentState::EnrollmentComplete).unwrap();
        assert_eq!(json, "\"enrollmentComplete\"");
    }

    #[test]
    fn valid_spec_has_no_violations() {
        assert!(sample_spec().validate().is_empty());
    }

    #[test]
    fn group_unit_requires_group_type() {
        let spec = ExperimentSpec {
            assignment_unit: AssignmentUnit::Group,
            ..sample_spec()
        };
        assert_eq!(spec.validate(), vec![Violation::MissingGroupType]);
    }

    #[test]
    fn group_consistency_requires_group_unit() {
        let spec = ExperimentSpec {
            consistency_rule: ConsistencyRule::Group,
            group_type: Some("class".to_string()),
            ..sample_spec()
        };
        assert_eq!(
            spec.validate(),
            vec![Violation::GroupConsistencyRequiresGroupUnit]
        );
    }

    #[test]
    fn assign_rule_needs_known_target() {
        let missing = ExperimentSpec {
            post_experiment_rule: PostExperimentRule::Assign,
            ..sample_spec()
        };
        assert_eq!(
            missing.validate(),
            vec![Violation::InvalidRevertTarget { value: None }]
        );

        let unknown = ExperimentSpec {
            post_experiment_rule: PostExperimentRule::Assign,
            revert_to: Some("ZZ".to_string()),
            ..sample_spec()
        };
        assert_eq!(
            unknown.validate(),
            vec![Violation::InvalidRevertTarget {
                value: Some("ZZ".to_string())
            }]
        );

        let known = ExperimentSpec {
            post_experiment_rule: PostExperimentRule::Assign,
            revert_to: Some("CA".to_string()),
            ..sample_spec()
        };
        assert!(known.validate().is_empty());
    }

    #[test]
    fn blank_context_is_rejected() {
        let spec = ExperimentSpec {
            context: vec![" ".to_string()],
            ..sample_spec()
        };
        assert_eq!(spec.validate(), vec![Violation::NoContext]);
    }

    #[test]
    fn condition_spec_reports_every_violation() {
        let spec = ConditionSpec {
            id: None,
            code: String::new(),
            description: String::new(),
            assignment_weight: 120,
            two_character_id: "ABC".to_string(),
        };
        let violations = spec.validate();
        assert_eq!(violations.len(), 3);
        assert!(violations.contains(&Violation::EmptyField {
            field: "condition code"
        }));
    }

    #[test]
    fn partition_spec_checks_composite_id() {
        let spec = PartitionSpec {
            id: Some(PartitionId("T1_Other".to_string())),
            exp_point: "Test".to_string(),
            exp_id: Some("T1".to_string()),
            description: String::new(),
            two_character_id: "T1".to_string(),
        };
        assert_eq!(
            spec.validate(),
            vec![Violation::PartitionIdMismatch {
                supplied: PartitionId("T1_Other".to_string()),
                expected: PartitionId("T1_Test".to_string()),
            }]
        );
    }

    #[test]
    fn experiment_spec_parses_camel_case_json() {
        let json = r#"{
            "name": "e",
            "context": ["home"],
            "state": "enrolling",
            "postExperimentRule": "revertToDefault",
            "assignmentUnit": "individual",
            "consistencyRule": "experiment",
            "conditions": [
                {"code": "A", "assignmentWeight": 70, "twoCharacterId": "CA"}
            ],
            "partitions": [
                {"expPoint": "Select", "expId": "W1", "twoCharacterId": "W1"}
            ]
        }"#;
        let spec: ExperimentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.post_experiment_rule, PostExperimentRule::RevertToDefault);
        assert_eq!(spec.consistency_rule, ConsistencyRule::Experiment);
        assert_eq!(spec.partitions[0].composite_id().as_str(), "W1_Select");
        assert!(spec.conditions[0].id.is_none());
    }
}
