//! Condition catalog: the arms of each experiment and their weights.

use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, NotFound, Result};
use crate::experiment::{Condition, ConditionSpec, ExperimentState};
use crate::storage::{ExperimentStore, WriteOp};
use crate::types::{ConditionId, ExperimentId};
use crate::validation::Violation;

pub struct ConditionCatalog {
    store: Arc<dyn ExperimentStore>,
    clock: Arc<dyn Clock>,
}

impl ConditionCatalog {
    pub fn new(store: Arc<dyn ExperimentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate `specs` and materialise them as the conditions of
    /// `experiment_id`, in declaration order.
    ///
    /// A spec carrying the id of a stored condition of the experiment updates
    /// it in place; any other spec creates a condition. A supplied id is
    /// kept unless another experiment or an earlier spec already holds it.
    /// Nothing is written.
    pub async fn register(
        &self,
        experiment_id: ExperimentId,
        state: ExperimentState,
        specs: &[ConditionSpec],
    ) -> Result<Vec<Condition>> {
        let mut violations: Vec<Violation> =
            specs.iter().flat_map(ConditionSpec::validate).collect();
        if specs.is_empty() && state == ExperimentState::Enrolling {
            violations.push(Violation::NoConditions);
        }
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.two_character_id.as_str()) {
                violations.push(Violation::DuplicateTwoCharId {
                    value: spec.two_character_id.clone(),
                    owner: None,
                });
            }
        }
        Error::check(violations)?;

        let mut stored = Vec::new();
        let mut foreign = HashSet::new();
        for experiment in self.store.list_experiments().await? {
            if experiment.id == experiment_id {
                stored = experiment.conditions;
            } else {
                foreign.extend(experiment.conditions.iter().map(|c| c.id));
            }
        }

        let now = self.clock.now();
        // Ids owned by another experiment are never claimed.
        let mut claimed = foreign;
        let conditions = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let order = i as u32;
                let claim = spec.id.filter(|id| claimed.insert(*id));
                let existing = claim.and_then(|id| stored.iter().find(|c| c.id == id));
                match existing {
                    Some(c) if !c.differs_from(spec, order) => c.clone(),
                    Some(c) => Condition {
                        code: spec.code.clone(),
                        description: spec.description.clone(),
                        assignment_weight: spec.assignment_weight,
                        two_character_id: spec.two_character_id.clone(),
                        order,
                        version: c.version + 1,
                        updated_at: now,
                        ..c.clone()
                    },
                    None => Condition {
                        id: claim.unwrap_or_default(),
                        experiment_id,
                        code: spec.code.clone(),
                        description: spec.description.clone(),
                        assignment_weight: spec.assignment_weight,
                        two_character_id: spec.two_character_id.clone(),
                        order,
                        version: 1,
                        created_at: now,
                        updated_at: now,
                    },
                }
            })
            .collect();
        Ok(conditions)
    }

    /// Conditions of an experiment paired with their weights.
    pub async fn weighted_conditions(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Vec<(Condition, u32)>> {
        Ok(self
            .list_by_experiment(experiment_id)
            .await?
            .into_iter()
            .map(|c| {
                let weight = c.assignment_weight;
                (c, weight)
            })
            .collect())
    }

    pub async fn list_by_experiment(&self, experiment_id: ExperimentId) -> Result<Vec<Condition>> {
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await?
            .ok_or(NotFound::Experiment(experiment_id))?;
        Ok(experiment.conditions)
    }
}

/// Ordered steps removing one condition and what depends on it.
pub fn removal_ops(condition: &Condition) -> Vec<WriteOp> {
    vec![
        WriteOp::PurgeOverridesForCondition(condition.id),
        WriteOp::PurgeAssignmentsForCondition(condition.id),
        WriteOp::DeleteCondition(condition.id),
    ]
}

/// Conditions in `old` that no longer appear in `new`.
pub(crate) fn removed<'a>(old: &'a [Condition], new: &[Condition]) -> Vec<&'a Condition> {
    let kept: HashSet<ConditionId> = new.iter().map(|c| c.id).collect();
    old.iter().filter(|c| !kept.contains(&c.id)).collect()
}
