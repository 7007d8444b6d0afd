//! Manual condition pins for production users.

use std::sync::Arc;

use tracing::info;

use super::{ExplicitAssignment, OverrideScope};
use crate::clock::Clock;
use crate::error::{NotFound, Result};
use crate::experiment::Condition;
use crate::storage::{ExperimentStore, OverrideStore};
use crate::types::{AssignmentId, ConditionId, ExperimentId, UserId};

/// Individual-scope explicit assignments.
pub struct ExplicitAssignments {
    experiments: Arc<dyn ExperimentStore>,
    overrides: Arc<dyn OverrideStore>,
    clock: Arc<dyn Clock>,
}

impl ExplicitAssignments {
    pub fn new(
        experiments: Arc<dyn ExperimentStore>,
        overrides: Arc<dyn OverrideStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            experiments,
            overrides,
            clock,
        }
    }

    /// Pin `user_id` to a condition. Last write wins.
    ///
    /// An existing pin keeps its id and creation time; its version moves
    /// when the condition changes. A concurrent first pin for the same user
    /// and experiment surfaces as a storage `UniqueViolation`.
    pub async fn upsert(
        &self,
        user_id: &UserId,
        experiment_id: ExperimentId,
        condition_id: ConditionId,
    ) -> Result<ExplicitAssignment> {
        let experiment = self
            .experiments
            .get_experiment(experiment_id)
            .await?
            .ok_or(NotFound::Experiment(experiment_id))?;
        if experiment.condition(condition_id).is_none() {
            return Err(NotFound::Condition {
                experiment: experiment_id,
                condition: condition_id,
            }
            .into());
        }

        let assignment = self.next_pin(user_id, experiment_id, condition_id).await?;
        self.overrides.save_explicit(&assignment).await?;
        info!(
            user = %user_id,
            experiment = %experiment_id,
            condition = %condition_id,
            version = assignment.version,
            "explicit assignment saved"
        );
        Ok(assignment)
    }

    async fn next_pin(
        &self,
        user_id: &UserId,
        experiment_id: ExperimentId,
        condition_id: ConditionId,
    ) -> Result<ExplicitAssignment> {
        let now = self.clock.now();
        let existing = self
            .overrides
            .get_explicit(user_id, experiment_id, OverrideScope::Individual)
            .await?;
        Ok(match existing {
            Some(current) if current.condition_id == condition_id => current,
            Some(current) => ExplicitAssignment {
                condition_id,
                version: current.version + 1,
                updated_at: now,
                ..current
            },
            None => ExplicitAssignment {
                id: AssignmentId::new(),
                user_id: user_id.clone(),
                experiment_id,
                condition_id,
                scope: OverrideScope::Individual,
                version: 1,
                created_at: now,
                updated_at: now,
            },
        })
    }

    /// The pinned condition, if the user has a pin that still resolves.
    pub async fn get(
        &self,
        user_id: &UserId,
        experiment_id: ExperimentId,
    ) -> Result<Option<Condition>> {
        let Some(assignment) = self
            .overrides
            .get_explicit(user_id, experiment_id, OverrideScope::Individual)
            .await?
        else {
            return Ok(None);
        };
        let experiment = self.experiments.get_experiment(experiment_id).await?;
        Ok(experiment.and_then(|e| e.condition(assignment.condition_id).cloned()))
    }

    /// Remove a pin. Returns whether one existed.
    pub async fn delete(&self, user_id: &UserId, experiment_id: ExperimentId) -> Result<bool> {
        let Some(assignment) = self
            .overrides
            .get_explicit(user_id, experiment_id, OverrideScope::Individual)
            .await?
        else {
            return Ok(false);
        };
        let deleted = self.overrides.delete_explicit(assignment.id).await?;
        if deleted {
            info!(user = %user_id, experiment = %experiment_id, "explicit assignment deleted");
        }
        Ok(deleted)
    }

    pub async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<ExplicitAssignment>> {
        Ok(self
            .overrides
            .list_explicit(user_id, OverrideScope::Individual)
            .await?)
    }
}
