//! Shared builders for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use upgrade_core::clock::{SeededRandom, SystemClock};
use upgrade_core::storage::MemoryStore;
use upgrade_core::{
    AssignmentUnit, ConditionSpec, ConsistencyRule, Experiment, ExperimentSpec, ExperimentState,
    PartitionSpec, PostExperimentRule, Services,
};

pub fn memory_services(seed: u64) -> Services {
    Services::new(
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(SeededRandom::new(seed)),
    )
}

pub fn condition(code: &str, weight: u32, two_char: &str) -> ConditionSpec {
    ConditionSpec {
        id: None,
        code: code.to_string(),
        description: String::new(),
        assignment_weight: weight,
        two_character_id: two_char.to_string(),
    }
}

pub fn partition(exp_point: &str, two_char: &str) -> PartitionSpec {
    PartitionSpec {
        id: None,
        exp_point: exp_point.to_string(),
        exp_id: None,
        description: String::new(),
        two_character_id: two_char.to_string(),
    }
}

/// Enrolling individual experiment in the `app` context.
pub fn experiment(conditions: Vec<ConditionSpec>, partitions: Vec<PartitionSpec>) -> ExperimentSpec {
    ExperimentSpec {
        name: "E".to_string(),
        description: String::new(),
        context: vec!["app".to_string()],
        state: ExperimentState::Enrolling,
        post_experiment_rule: PostExperimentRule::Continue,
        revert_to: None,
        assignment_unit: AssignmentUnit::Individual,
        consistency_rule: ConsistencyRule::Individual,
        group_type: None,
        version: None,
        conditions,
        partitions,
    }
}

/// The document a client sends back after reading `experiment`, with ids.
pub fn edit_of(experiment: &Experiment) -> ExperimentSpec {
    ExperimentSpec {
        name: experiment.name.clone(),
        description: experiment.description.clone(),
        context: experiment.context.clone(),
        state: experiment.state,
        post_experiment_rule: experiment.post_experiment_rule,
        revert_to: None,
        assignment_unit: experiment.assignment_unit,
        consistency_rule: experiment.consistency_rule,
        group_type: experiment.group_type.clone(),
        version: Some(experiment.version),
        conditions: experiment
            .conditions
            .iter()
            .map(|c| ConditionSpec {
                id: Some(c.id),
                code: c.code.clone(),
                description: c.description.clone(),
                assignment_weight: c.assignment_weight,
                two_character_id: c.two_character_id.clone(),
            })
            .collect(),
        partitions: experiment
            .partitions
            .iter()
            .map(|p| PartitionSpec {
                id: Some(p.id.clone()),
                exp_point: p.exp_point.clone(),
                exp_id: p.exp_id.clone(),
                description: p.description.clone(),
                two_character_id: p.two_character_id.clone(),
            })
            .collect(),
    }
}

/// Two conditions `A`/`B` at 50/50 and one partition `W1`.
pub fn ab_experiment() -> ExperimentSpec {
    experiment(
        vec![condition("A", 50, "CA"), condition("B", 50, "CB")],
        vec![partition("P", "W1")],
    )
}
