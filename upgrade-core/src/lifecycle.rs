//! Experiment lifecycle: create, edit, transition, delete.
//!
//! Every write is planned against a loaded snapshot and committed as one
//! [`Transaction`] guarded by the snapshot's version. Edits diff conditions
//! and partitions by id, so unchanged children keep their identity and the
//! assignments that depend on them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::conditions::{self, ConditionCatalog};
use crate::error::{Error, NotFound, Result};
use crate::experiment::{
    Condition, Experiment, ExperimentRow, ExperimentSpec, ExperimentState, Partition,
};
use crate::partitions::{self, PartitionRegistry};
use crate::storage::{ExperimentStore, Transaction, WriteOp};
use crate::types::{ConditionId, ExperimentId};
use crate::validation::Violation;

/// Who performed a lifecycle write. Recorded in logs only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub String);

impl Actor {
    /// Writes issued by the platform itself.
    pub fn system() -> Self {
        Self("system".to_string())
    }
}

impl From<&str> for Actor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ExperimentManager {
    store: Arc<dyn ExperimentStore>,
    conditions: ConditionCatalog,
    partitions: PartitionRegistry,
    clock: Arc<dyn Clock>,
}

impl ExperimentManager {
    pub fn new(store: Arc<dyn ExperimentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conditions: ConditionCatalog::new(store.clone(), clock.clone()),
            partitions: PartitionRegistry::new(store.clone(), clock.clone()),
            store,
            clock,
        }
    }

    // === Commands ===

    /// Create an experiment with its conditions and partitions.
    pub async fn create(&self, spec: ExperimentSpec, actor: &Actor) -> Result<Experiment> {
        let id = ExperimentId::new();
        let (conditions, partitions) = self.register_children(id, &spec).await?;

        let now = self.clock.now();
        let row = build_row(id, &spec, &conditions, 1, now, now);

        let mut ops: Vec<WriteOp> = conditions
            .iter()
            .cloned()
            .map(WriteOp::UpsertCondition)
            .collect();
        ops.extend(partitions.iter().cloned().map(WriteOp::UpsertPartition));
        ops.push(WriteOp::PutExperiment(row.clone()));

        self.store
            .commit(Transaction {
                experiment_id: id,
                expected_version: None,
                ops,
            })
            .await?;

        info!(
            experiment = %id,
            name = %row.name,
            conditions = conditions.len(),
            partitions = partitions.len(),
            %actor,
            "experiment created"
        );
        Ok(row.into_experiment(conditions, partitions))
    }

    /// Replace an experiment's definition.
    ///
    /// Conditions and partitions are matched by id. Removed ones are deleted
    /// together with the overrides, assignment records and visits that point
    /// at them; matched ones are updated in place. Fails with
    /// [`Error::Conflict`] when `spec.version` (or the stored version, when
    /// absent) no longer matches.
    pub async fn update(
        &self,
        id: ExperimentId,
        spec: ExperimentSpec,
        actor: &Actor,
    ) -> Result<Experiment> {
        let current = self.load(id).await?;
        let expected = spec.version.unwrap_or(current.version);
        if expected != current.version {
            return Err(Error::Conflict {
                expected,
                actual: current.version,
            });
        }

        let (conditions, partitions) = self.register_children(id, &spec).await?;
        let removed_conditions = conditions::removed(&current.conditions, &conditions);
        let removed_partitions = partitions::removed(&current.partitions, &partitions);

        let mut ops: Vec<WriteOp> = removed_conditions
            .iter()
            .flat_map(|c| conditions::removal_ops(c))
            .collect();
        ops.extend(
            removed_partitions
                .iter()
                .flat_map(|p| partitions::removal_ops(p)),
        );
        ops.extend(
            conditions
                .iter()
                .filter(|c| !current.conditions.contains(c))
                .cloned()
                .map(WriteOp::UpsertCondition),
        );
        ops.extend(
            partitions
                .iter()
                .filter(|p| !current.partitions.contains(p))
                .cloned()
                .map(WriteOp::UpsertPartition),
        );

        let row = build_row(
            id,
            &spec,
            &conditions,
            current.version + 1,
            current.created_at,
            self.clock.now(),
        );
        ops.push(WriteOp::PutExperiment(row.clone()));

        self.store
            .commit(Transaction {
                experiment_id: id,
                expected_version: Some(expected),
                ops,
            })
            .await?;

        info!(
            experiment = %id,
            version = row.version,
            removed_conditions = removed_conditions.len(),
            removed_partitions = removed_partitions.len(),
            %actor,
            "experiment updated"
        );
        Ok(row.into_experiment(conditions, partitions))
    }

    /// Move an experiment to another state.
    pub async fn update_state(
        &self,
        id: ExperimentId,
        state: ExperimentState,
        actor: &Actor,
    ) -> Result<Experiment> {
        let current = self.load(id).await?;
        if state == ExperimentState::Enrolling && current.conditions.is_empty() {
            return Err(Error::Validation(vec![Violation::NoConditions]));
        }

        let mut row = current.row();
        let from = row.state;
        row.state = state;
        row.version += 1;
        row.updated_at = self.clock.now();

        self.store
            .commit(Transaction {
                experiment_id: id,
                expected_version: Some(current.version),
                ops: vec![WriteOp::PutExperiment(row.clone())],
            })
            .await?;

        info!(
            experiment = %id,
            from = from.as_str(),
            to = state.as_str(),
            %actor,
            "experiment state changed"
        );
        Ok(row.into_experiment(current.conditions, current.partitions))
    }

    /// Delete an experiment and everything that depends on it.
    pub async fn delete(&self, id: ExperimentId, actor: &Actor) -> Result<Experiment> {
        let current = self.load(id).await?;

        let mut ops = vec![
            WriteOp::PurgeOverridesForExperiment(id),
            WriteOp::PurgeAssignmentsForExperiment(id),
        ];
        ops.extend(
            current
                .partitions
                .iter()
                .map(|p| WriteOp::DeletePartition(p.id.clone())),
        );
        ops.extend(
            current
                .conditions
                .iter()
                .map(|c| WriteOp::DeleteCondition(c.id)),
        );
        ops.push(WriteOp::DeleteExperiment(id));

        self.store
            .commit(Transaction {
                experiment_id: id,
                expected_version: Some(current.version),
                ops,
            })
            .await?;

        info!(experiment = %id, name = %current.name, %actor, "experiment deleted");
        Ok(current)
    }

    /// Delete every partition of an experiment, keeping the experiment.
    pub async fn delete_partitions(&self, id: ExperimentId, actor: &Actor) -> Result<Vec<Partition>> {
        let deleted = self.partitions.delete_by_experiment(id).await?;
        info!(experiment = %id, count = deleted.len(), %actor, "partitions cleared");
        Ok(deleted)
    }

    // === Queries ===

    pub async fn get(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.store.get_experiment(id).await?)
    }

    /// All experiments, oldest first.
    pub async fn find(&self) -> Result<Vec<Experiment>> {
        Ok(self.store.list_experiments().await?)
    }

    pub async fn list_partitions(&self, id: ExperimentId) -> Result<Vec<Partition>> {
        self.partitions.list_by_experiment(id).await
    }

    pub async fn list_conditions(&self, id: ExperimentId) -> Result<Vec<Condition>> {
        self.conditions.list_by_experiment(id).await
    }

    pub async fn list_all_partitions(&self) -> Result<Vec<Partition>> {
        self.partitions.list_all().await
    }

    pub async fn find_partition(&self, two_char_id: &str) -> Result<Option<Partition>> {
        self.partitions.find_by_two_char_id(two_char_id).await
    }

    async fn load(&self, id: ExperimentId) -> Result<Experiment> {
        Ok(self
            .store
            .get_experiment(id)
            .await?
            .ok_or(NotFound::Experiment(id))?)
    }

    /// Validate the whole document and materialise its children, reporting
    /// every violation at once.
    async fn register_children(
        &self,
        id: ExperimentId,
        spec: &ExperimentSpec,
    ) -> Result<(Vec<Condition>, Vec<Partition>)> {
        let mut violations = spec.validate();

        let conditions = match self.conditions.register(id, spec.state, &spec.conditions).await {
            Ok(conditions) => conditions,
            Err(Error::Validation(found)) => {
                violations.extend(found);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let partitions = match self.partitions.register(id, &spec.partitions).await {
            Ok(partitions) => partitions,
            Err(Error::Validation(found)) => {
                violations.extend(found);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        Error::check(violations)?;
        Ok((conditions, partitions))
    }
}

fn build_row(
    id: ExperimentId,
    spec: &ExperimentSpec,
    conditions: &[Condition],
    version: u64,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
) -> ExperimentRow {
    let revert_to: Option<ConditionId> = spec.revert_to.as_deref().and_then(|target| {
        conditions
            .iter()
            .find(|c| c.two_character_id == target)
            .map(|c| c.id)
    });
    ExperimentRow {
        id,
        name: spec.name.clone(),
        description: spec.description.clone(),
        context: spec.context.clone(),
        state: spec.state,
        post_experiment_rule: spec.post_experiment_rule,
        revert_to,
        assignment_unit: spec.assignment_unit,
        consistency_rule: spec.consistency_rule,
        group_type: spec.group_type.clone(),
        version,
        created_at,
        updated_at,
    }
}
