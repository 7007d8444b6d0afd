//! In-process store backing all three storage traits.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AssignmentStore, Error, ExperimentStore, InsertOutcome, OverrideStore, Result, Transaction,
    WriteOp,
};
use crate::engine::{AssignmentRecord, DecisionPointVisit};
use crate::experiment::{Condition, Experiment, ExperimentRow, Partition};
use crate::overrides::{ExplicitAssignment, OverrideScope, PreviewUser};
use crate::types::{AssignmentId, ConditionId, ExperimentId, PartitionId, UserId};

#[derive(Debug, Default, Clone)]
struct Tables {
    experiments: HashMap<ExperimentId, ExperimentRow>,
    conditions: HashMap<ConditionId, Condition>,
    partitions: BTreeMap<PartitionId, Partition>,
    explicit: HashMap<AssignmentId, ExplicitAssignment>,
    preview_users: HashMap<UserId, PreviewUser>,
    assignments: HashMap<(String, ExperimentId), AssignmentRecord>,
    visits: HashMap<(UserId, PartitionId), DecisionPointVisit>,
}

impl Tables {
    fn assemble(&self, row: &ExperimentRow) -> Experiment {
        let conditions = self
            .conditions
            .values()
            .filter(|c| c.experiment_id == row.id)
            .cloned()
            .collect();
        let partitions = self
            .partitions
            .values()
            .filter(|p| p.experiment_id == row.id)
            .cloned()
            .collect();
        row.clone().into_experiment(conditions, partitions)
    }

    fn check_version(&self, tx: &Transaction) -> Result<()> {
        let stored = self.experiments.get(&tx.experiment_id).map(|r| r.version);
        match (tx.expected_version, stored) {
            (None, Some(_)) => Err(Error::AlreadyExists(tx.experiment_id)),
            (Some(_), None) => Err(Error::ExperimentNotFound(tx.experiment_id)),
            (Some(expected), Some(actual)) if expected != actual => {
                Err(Error::VersionConflict { expected, actual })
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::PurgeOverridesForCondition(id) => {
                self.explicit.retain(|_, a| a.condition_id != id);
            }
            WriteOp::PurgeOverridesForExperiment(id) => {
                self.explicit.retain(|_, a| a.experiment_id != id);
            }
            WriteOp::PurgeAssignmentsForCondition(id) => {
                self.assignments.retain(|_, r| r.condition_id != id);
            }
            WriteOp::PurgeAssignmentsForPartition(id) => {
                self.assignments
                    .retain(|_, r| r.partition_id.as_ref() != Some(&id));
                self.visits.retain(|_, v| v.partition_id != id);
            }
            WriteOp::PurgeAssignmentsForExperiment(id) => {
                self.assignments.retain(|_, r| r.experiment_id != id);
                self.visits.retain(|_, v| v.experiment_id != id);
            }
            WriteOp::DeletePartition(id) => {
                self.partitions.remove(&id);
            }
            WriteOp::DeleteCondition(id) => {
                self.conditions.remove(&id);
            }
            WriteOp::UpsertCondition(condition) => {
                let clash = self.conditions.values().any(|c| {
                    c.id != condition.id
                        && c.experiment_id == condition.experiment_id
                        && c.two_character_id == condition.two_character_id
                });
                if clash {
                    return Err(Error::UniqueViolation(format!(
                        "condition two-character id {}",
                        condition.two_character_id
                    )));
                }
                if let Some(existing) = self.conditions.get(&condition.id)
                    && existing.experiment_id != condition.experiment_id
                {
                    return Err(Error::UniqueViolation(format!("condition id {}", condition.id)));
                }
                self.conditions.insert(condition.id, condition);
            }
            WriteOp::UpsertPartition(partition) => {
                if let Some(owner) = self.partitions.values().find(|p| {
                    p.id != partition.id && p.two_character_id == partition.two_character_id
                }) {
                    if owner.experiment_id != partition.experiment_id {
                        return Err(Error::DuplicateTwoCharId {
                            two_character_id: partition.two_character_id,
                            experiment_id: owner.experiment_id,
                        });
                    }
                    return Err(Error::UniqueViolation(format!(
                        "partition two-character id {}",
                        partition.two_character_id
                    )));
                }
                if let Some(existing) = self.partitions.get(&partition.id)
                    && existing.experiment_id != partition.experiment_id
                {
                    return Err(Error::UniqueViolation(format!("partition id {}", partition.id)));
                }
                self.partitions.insert(partition.id.clone(), partition);
            }
            WriteOp::PutExperiment(row) => {
                self.experiments.insert(row.id, row);
            }
            WriteOp::DeleteExperiment(id) => {
                self.experiments.remove(&id);
            }
        }
        Ok(())
    }

    fn preview_assignments(&self, user_id: &UserId) -> Vec<ExplicitAssignment> {
        let mut assignments: Vec<_> = self
            .explicit
            .values()
            .filter(|a| &a.user_id == user_id && a.scope == OverrideScope::Preview)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| (a.created_at, a.id.0));
        assignments
    }

    fn load_preview_user(&self, user: &PreviewUser) -> PreviewUser {
        PreviewUser {
            assignments: self.preview_assignments(&user.id),
            ..user.clone()
        }
    }
}

/// Store that keeps all state in memory.
///
/// Every read and write takes one lock, so a transaction is observed
/// entirely or not at all.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        let tables = self.tables.read().await;
        Ok(tables.experiments.get(&id).map(|row| tables.assemble(row)))
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.experiments.values().collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        Ok(rows.into_iter().map(|row| tables.assemble(row)).collect())
    }

    async fn find_experiment_by_partition(
        &self,
        two_char_id: &str,
    ) -> Result<Option<Experiment>> {
        let tables = self.tables.read().await;
        let owner = tables
            .partitions
            .values()
            .find(|p| p.two_character_id == two_char_id)
            .and_then(|p| tables.experiments.get(&p.experiment_id));
        Ok(owner.map(|row| tables.assemble(row)))
    }

    async fn find_partition_by_two_char_id(&self, two_char_id: &str) -> Result<Option<Partition>> {
        let tables = self.tables.read().await;
        Ok(tables
            .partitions
            .values()
            .find(|p| p.two_character_id == two_char_id)
            .cloned())
    }

    async fn list_partitions(&self) -> Result<Vec<Partition>> {
        let tables = self.tables.read().await;
        Ok(tables.partitions.values().cloned().collect())
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.check_version(&tx)?;

        let mut staged = tables.clone();
        for op in tx.ops {
            staged.apply(op)?;
        }
        *tables = staged;
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn get_assignment(
        &self,
        selection_key: &str,
        experiment_id: ExperimentId,
    ) -> Result<Option<AssignmentRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .assignments
            .get(&(selection_key.to_string(), experiment_id))
            .cloned())
    }

    async fn insert_if_absent(&self, record: AssignmentRecord) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let key = (record.selection_key.clone(), record.experiment_id);
        if let Some(existing) = tables.assignments.get(&key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        let condition_live = tables
            .conditions
            .get(&record.condition_id)
            .is_some_and(|c| c.experiment_id == record.experiment_id);
        let partition_live = record
            .partition_id
            .as_ref()
            .is_none_or(|id| tables.partitions.contains_key(id));
        if !condition_live || !partition_live {
            return Ok(InsertOutcome::Stale);
        }

        tables.assignments.insert(key, record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn list_assignments(&self, experiment_id: ExperimentId) -> Result<Vec<AssignmentRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .assignments
            .values()
            .filter(|r| r.experiment_id == experiment_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.selection_key.cmp(&b.selection_key));
        Ok(records)
    }

    async fn record_visit(&self, visit: &DecisionPointVisit) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.partitions.contains_key(&visit.partition_id) {
            return Ok(());
        }
        tables.visits.insert(
            (visit.user_id.clone(), visit.partition_id.clone()),
            visit.clone(),
        );
        Ok(())
    }

    async fn list_visits(&self, experiment_id: ExperimentId) -> Result<Vec<DecisionPointVisit>> {
        let tables = self.tables.read().await;
        let mut visits: Vec<_> = tables
            .visits
            .values()
            .filter(|v| v.experiment_id == experiment_id)
            .cloned()
            .collect();
        visits.sort_by(|a, b| {
            (&a.partition_id, &a.user_id).cmp(&(&b.partition_id, &b.user_id))
        });
        Ok(visits)
    }
}

#[async_trait]
impl OverrideStore for MemoryStore {
    async fn get_explicit(
        &self,
        user_id: &UserId,
        experiment_id: ExperimentId,
        scope: OverrideScope,
    ) -> Result<Option<ExplicitAssignment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .explicit
            .values()
            .find(|a| {
                &a.user_id == user_id && a.experiment_id == experiment_id && a.scope == scope
            })
            .cloned())
    }

    async fn list_explicit(
        &self,
        user_id: &UserId,
        scope: OverrideScope,
    ) -> Result<Vec<ExplicitAssignment>> {
        let tables = self.tables.read().await;
        let mut assignments: Vec<_> = tables
            .explicit
            .values()
            .filter(|a| &a.user_id == user_id && a.scope == scope)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| (a.created_at, a.id.0));
        Ok(assignments)
    }

    async fn save_explicit(&self, assignment: &ExplicitAssignment) -> Result<()> {
        let mut tables = self.tables.write().await;
        let clash = tables.explicit.values().any(|a| {
            a.id != assignment.id
                && a.user_id == assignment.user_id
                && a.experiment_id == assignment.experiment_id
                && a.scope == assignment.scope
        });
        if clash {
            return Err(Error::UniqueViolation(format!(
                "explicit assignment for {} in experiment {}",
                assignment.user_id, assignment.experiment_id
            )));
        }
        tables.explicit.insert(assignment.id, assignment.clone());
        Ok(())
    }

    async fn delete_explicit(&self, id: AssignmentId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.explicit.remove(&id).is_some())
    }

    async fn is_preview(&self, user_id: &UserId) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.preview_users.contains_key(user_id))
    }

    async fn put_preview_user(&self, user: &PreviewUser) -> Result<()> {
        let mut tables = self.tables.write().await;
        let row = PreviewUser {
            assignments: Vec::new(),
            ..user.clone()
        };
        tables.preview_users.insert(row.id.clone(), row);
        Ok(())
    }

    async fn get_preview_user(&self, user_id: &UserId) -> Result<Option<PreviewUser>> {
        let tables = self.tables.read().await;
        Ok(tables
            .preview_users
            .get(user_id)
            .map(|user| tables.load_preview_user(user)))
    }

    async fn list_preview_users(
        &self,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<PreviewUser>> {
        let tables = self.tables.read().await;
        let mut users: Vec<_> = tables.preview_users.values().collect();
        users.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(users
            .into_iter()
            .skip(skip)
            .take(take.unwrap_or(usize::MAX))
            .map(|user| tables.load_preview_user(user))
            .collect())
    }

    async fn count_preview_users(&self) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables.preview_users.len() as u64)
    }

    async fn delete_preview_user(&self, user_id: &UserId) -> Result<Option<PreviewUser>> {
        let mut tables = self.tables.write().await;
        let Some(user) = tables.preview_users.remove(user_id) else {
            return Ok(None);
        };
        let user = tables.load_preview_user(&user);
        tables
            .explicit
            .retain(|_, a| !(&a.user_id == user_id && a.scope == OverrideScope::Preview));
        Ok(Some(user))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::experiment::{
        AssignmentUnit, ConsistencyRule, ExperimentState, PostExperimentRule,
    };

    fn row(id: ExperimentId, version: u64) -> ExperimentRow {
        let now = Utc::now();
        ExperimentRow {
            id,
            name: "exp".into(),
            description: String::new(),
            context: vec!["app".into()],
            state: ExperimentState::Enrolling,
            post_experiment_rule: PostExperimentRule::Continue,
            revert_to: None,
            assignment_unit: AssignmentUnit::Individual,
            consistency_rule: ConsistencyRule::Individual,
            group_type: None,
            version,
            created_at: now,
            updated_at: now,
        }
    }

    fn partition(experiment_id: ExperimentId, point: &str, two_char: &str) -> Partition {
        let now = Utc::now();
        Partition {
            id: PartitionId::compose(None, point),
            experiment_id,
            exp_point: point.into(),
            exp_id: None,
            two_character_id: two_char.into(),
            description: String::new(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn condition(experiment_id: ExperimentId, code: &str, two_char: &str) -> Condition {
        let now = Utc::now();
        Condition {
            id: ConditionId::new(),
            experiment_id,
            code: code.into(),
            description: String::new(),
            assignment_weight: 50,
            two_character_id: two_char.into(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn create(id: ExperimentId, ops: Vec<WriteOp>) -> Transaction {
        Transaction {
            experiment_id: id,
            expected_version: None,
            ops,
        }
    }

    #[tokio::test]
    async fn commit_assembles_experiment() {
        let store = MemoryStore::new();
        let id = ExperimentId::new();
        let cond = condition(id, "A", "C1");
        store
            .commit(create(
                id,
                vec![
                    WriteOp::PutExperiment(row(id, 1)),
                    WriteOp::UpsertCondition(cond.clone()),
                    WriteOp::UpsertPartition(partition(id, "W1", "P1")),
                ],
            ))
            .await
            .unwrap();

        let experiment = store.get_experiment(id).await.unwrap().unwrap();
        assert_eq!(experiment.conditions, vec![cond]);
        assert_eq!(experiment.partitions.len(), 1);

        let found = store.find_experiment_by_partition("P1").await.unwrap();
        assert_eq!(found.map(|e| e.id), Some(id));
    }

    #[tokio::test]
    async fn failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        let first = ExperimentId::new();
        store
            .commit(create(
                first,
                vec![
                    WriteOp::PutExperiment(row(first, 1)),
                    WriteOp::UpsertPartition(partition(first, "W1", "P1")),
                ],
            ))
            .await
            .unwrap();

        let second = ExperimentId::new();
        let err = store
            .commit(create(
                second,
                vec![
                    WriteOp::PutExperiment(row(second, 1)),
                    WriteOp::UpsertPartition(partition(second, "W2", "P1")),
                ],
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateTwoCharId { experiment_id, .. } if experiment_id == first));
        assert!(store.get_experiment(second).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let id = ExperimentId::new();
        store
            .commit(create(id, vec![WriteOp::PutExperiment(row(id, 1))]))
            .await
            .unwrap();

        let err = store
            .commit(Transaction {
                experiment_id: id,
                expected_version: Some(3),
                ops: vec![WriteOp::PutExperiment(row(id, 4))],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 3, actual: 1 }));

        let err = store
            .commit(create(id, vec![WriteOp::PutExperiment(row(id, 1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_record() {
        let store = MemoryStore::new();
        let id = ExperimentId::new();
        let a = condition(id, "A", "C1");
        let b = condition(id, "B", "C2");
        store
            .commit(create(
                id,
                vec![
                    WriteOp::PutExperiment(row(id, 1)),
                    WriteOp::UpsertCondition(a.clone()),
                    WriteOp::UpsertCondition(b.clone()),
                ],
            ))
            .await
            .unwrap();

        let record = |condition_id| AssignmentRecord {
            selection_key: "user:u1".into(),
            experiment_id: id,
            partition_id: None,
            condition_id,
            created_at: Utc::now(),
        };
        let first = store.insert_if_absent(record(a.id)).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        let second = store.insert_if_absent(record(b.id)).await.unwrap();
        assert_eq!(second.record().map(|r| r.condition_id), Some(a.id));

        let gone = AssignmentRecord {
            selection_key: "user:u2".into(),
            ..record(ConditionId::new())
        };
        assert_eq!(store.insert_if_absent(gone).await.unwrap(), InsertOutcome::Stale);
    }

    #[tokio::test]
    async fn explicit_assignments_are_unique_per_scope() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let pin = ExplicitAssignment {
            id: AssignmentId::new(),
            user_id: "u1".into(),
            experiment_id: ExperimentId::new(),
            condition_id: ConditionId::new(),
            scope: OverrideScope::Individual,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        store.save_explicit(&pin).await.unwrap();

        let preview = ExplicitAssignment {
            id: AssignmentId::new(),
            scope: OverrideScope::Preview,
            ..pin.clone()
        };
        store.save_explicit(&preview).await.unwrap();

        let clash = ExplicitAssignment {
            id: AssignmentId::new(),
            ..pin.clone()
        };
        let err = store.save_explicit(&clash).await.unwrap_err();
        assert!(matches!(err, Error::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn deleting_preview_user_drops_preview_assignments_only() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = PreviewUser {
            id: "u2".into(),
            created_at: now,
            updated_at: now,
            assignments: Vec::new(),
        };
        store.put_preview_user(&user).await.unwrap();

        let preview = ExplicitAssignment {
            id: AssignmentId::new(),
            user_id: "u2".into(),
            experiment_id: ExperimentId::new(),
            condition_id: ConditionId::new(),
            scope: OverrideScope::Preview,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let pin = ExplicitAssignment {
            id: AssignmentId::new(),
            scope: OverrideScope::Individual,
            ..preview.clone()
        };
        store.save_explicit(&preview).await.unwrap();
        store.save_explicit(&pin).await.unwrap();

        let deleted = store.delete_preview_user(&user.id).await.unwrap().unwrap();
        assert_eq!(deleted.assignments, vec![preview]);
        assert!(!store.is_preview(&user.id).await.unwrap());
        assert_eq!(
            store
                .list_explicit(&user.id, OverrideScope::Individual)
                .await
                .unwrap(),
            vec![pin]
        );
    }
}
