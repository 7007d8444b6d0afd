//! Partition registry.
//!
//! Partitions are the decision points of an experiment. Their two-character
//! ids are globally unique so the host application can name a decision point
//! without knowing which experiment runs there.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::error::{Error, NotFound, Result};
use crate::experiment::{Partition, PartitionSpec};
use crate::storage::{ExperimentStore, Transaction, WriteOp};
use crate::types::{ExperimentId, PartitionId};
use crate::validation::Violation;

pub struct PartitionRegistry {
    store: Arc<dyn ExperimentStore>,
    clock: Arc<dyn Clock>,
}

impl PartitionRegistry {
    pub fn new(store: Arc<dyn ExperimentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate `specs` and materialise them as the partitions of
    /// `experiment_id`, in declaration order.
    ///
    /// A spec whose composite id matches a stored partition of the same
    /// experiment keeps that partition's identity; its version moves only
    /// when a field changed. Nothing is written: the caller commits the
    /// result inside its own transaction.
    pub async fn register(
        &self,
        experiment_id: ExperimentId,
        specs: &[PartitionSpec],
    ) -> Result<Vec<Partition>> {
        let mut violations: Vec<Violation> = specs.iter().flat_map(PartitionSpec::validate).collect();

        let mut seen_ids = HashSet::new();
        let mut seen_two_char = HashSet::new();
        for spec in specs {
            let id = spec.composite_id();
            if !seen_ids.insert(id.clone()) {
                violations.push(Violation::DuplicatePartitionId { id });
            }
            if !seen_two_char.insert(spec.two_character_id.as_str()) {
                violations.push(Violation::DuplicateTwoCharId {
                    value: spec.two_character_id.clone(),
                    owner: None,
                });
            }
        }

        let stored = self.store.list_partitions().await?;
        for spec in specs {
            let id = spec.composite_id();
            for other in stored.iter().filter(|p| p.experiment_id != experiment_id) {
                if other.two_character_id == spec.two_character_id {
                    violations.push(Violation::DuplicateTwoCharId {
                        value: spec.two_character_id.clone(),
                        owner: Some(other.experiment_id),
                    });
                }
                if other.id == id {
                    violations.push(Violation::DuplicatePartitionId { id: id.clone() });
                }
            }
        }
        Error::check(violations)?;

        let now = self.clock.now();
        let partitions = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let order = i as u32;
                let id = spec.composite_id();
                let existing = stored
                    .iter()
                    .find(|p| p.id == id && p.experiment_id == experiment_id);
                match existing {
                    Some(p) if !p.differs_from(spec, order) => p.clone(),
                    Some(p) => Partition {
                        two_character_id: spec.two_character_id.clone(),
                        description: spec.description.clone(),
                        order,
                        version: p.version + 1,
                        updated_at: now,
                        ..p.clone()
                    },
                    None => Partition {
                        id,
                        experiment_id,
                        exp_point: spec.exp_point.clone(),
                        exp_id: spec.exp_id.clone(),
                        two_character_id: spec.two_character_id.clone(),
                        description: spec.description.clone(),
                        order,
                        version: 1,
                        created_at: now,
                        updated_at: now,
                    },
                }
            })
            .collect();
        Ok(partitions)
    }

    pub async fn list_by_experiment(&self, experiment_id: ExperimentId) -> Result<Vec<Partition>> {
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await?
            .ok_or(NotFound::Experiment(experiment_id))?;
        Ok(experiment.partitions)
    }

    /// Partitions of every experiment.
    pub async fn list_all(&self) -> Result<Vec<Partition>> {
        Ok(self.store.list_partitions().await?)
    }

    pub async fn find_by_two_char_id(&self, two_char_id: &str) -> Result<Option<Partition>> {
        Ok(self.store.find_partition_by_two_char_id(two_char_id).await?)
    }

    /// Delete every partition of an experiment, with the assignment records
    /// and visits pinned to them, in one transaction.
    pub async fn delete_by_experiment(&self, experiment_id: ExperimentId) -> Result<Vec<Partition>> {
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await?
            .ok_or(NotFound::Experiment(experiment_id))?;

        let mut ops: Vec<WriteOp> = experiment.partitions.iter().flat_map(removal_ops).collect();
        let mut row = experiment.row();
        row.version += 1;
        row.updated_at = self.clock.now();
        ops.push(WriteOp::PutExperiment(row));

        self.store
            .commit(Transaction {
                experiment_id,
                expected_version: Some(experiment.version),
                ops,
            })
            .await?;

        info!(
            experiment = %experiment_id,
            count = experiment.partitions.len(),
            "deleted partitions"
        );
        Ok(experiment.partitions)
    }
}

/// Ordered steps removing one partition and what depends on it.
pub fn removal_ops(partition: &Partition) -> Vec<WriteOp> {
    vec![
        WriteOp::PurgeAssignmentsForPartition(partition.id.clone()),
        WriteOp::DeletePartition(partition.id.clone()),
    ]
}

/// Partition ids in `old` that no longer appear in `new`.
pub(crate) fn removed<'a>(old: &'a [Partition], new: &[Partition]) -> Vec<&'a Partition> {
    let kept: HashSet<&PartitionId> = new.iter().map(|p| &p.id).collect();
    old.iter().filter(|p| !kept.contains(&p.id)).collect()
}
