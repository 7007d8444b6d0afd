//! Storage contracts and implementations for the assignment platform.
//!
//! Three collaborator traits split the persisted state:
//! - [`ExperimentStore`] - experiment aggregates, written only through atomic
//!   [`Transaction`]s
//! - [`AssignmentStore`] - persisted randomized assignments and decision-point visits
//! - [`OverrideStore`] - explicit assignments and preview users
//!
//! [`MemoryStore`] keeps everything in process; the Turso implementation
//! stores data in libSQL. Both implement all three traits over one backing
//! state so a transaction can purge dependent rows atomically.

mod error;
mod memory;
mod turso;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use turso::TursoStore;

use async_trait::async_trait;

use crate::engine::{AssignmentRecord, DecisionPointVisit};
use crate::experiment::{Condition, Experiment, ExperimentRow, Partition};
use crate::overrides::{ExplicitAssignment, OverrideScope, PreviewUser};
use crate::types::{AssignmentId, ConditionId, ExperimentId, PartitionId, UserId};

/// One step of an experiment transaction. Steps run in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Delete explicit assignments (any scope) pointing at a condition
    PurgeOverridesForCondition(ConditionId),
    /// Delete explicit assignments (any scope) for an experiment
    PurgeOverridesForExperiment(ExperimentId),
    /// Delete assignment records pinned to a condition
    PurgeAssignmentsForCondition(ConditionId),
    /// Delete assignment records and visits pinned to a partition
    PurgeAssignmentsForPartition(PartitionId),
    /// Delete assignment records and visits of an experiment
    PurgeAssignmentsForExperiment(ExperimentId),
    DeletePartition(PartitionId),
    DeleteCondition(ConditionId),
    /// Insert or replace a condition by id
    UpsertCondition(Condition),
    /// Insert or replace a partition by id; its two-character id must not be
    /// owned by another experiment
    UpsertPartition(Partition),
    /// Insert or replace the experiment row
    PutExperiment(ExperimentRow),
    DeleteExperiment(ExperimentId),
}

/// An all-or-nothing write against one experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub experiment_id: ExperimentId,
    /// `None` when creating; otherwise the version the plan was computed from
    pub expected_version: Option<u64>,
    pub ops: Vec<WriteOp>,
}

/// Result of an insert-if-absent on an assignment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// This call wrote the record
    Inserted(AssignmentRecord),
    /// A record already existed for the key; it is returned unchanged
    Existing(AssignmentRecord),
    /// The condition or partition was deleted before the write landed
    Stale,
}

impl InsertOutcome {
    /// The persisted record, whichever call wrote it.
    pub fn record(&self) -> Option<&AssignmentRecord> {
        match self {
            Self::Inserted(record) | Self::Existing(record) => Some(record),
            Self::Stale => None,
        }
    }
}

/// Experiment aggregates.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Get an experiment with its conditions and partitions.
    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>>;

    /// List all experiments, oldest first.
    async fn list_experiments(&self) -> Result<Vec<Experiment>>;

    /// The experiment owning the partition with this two-character id,
    /// read as one consistent snapshot.
    async fn find_experiment_by_partition(&self, two_char_id: &str)
    -> Result<Option<Experiment>>;

    /// Find a partition by its globally unique two-character id.
    async fn find_partition_by_two_char_id(&self, two_char_id: &str)
    -> Result<Option<Partition>>;

    /// List partitions of every experiment.
    async fn list_partitions(&self) -> Result<Vec<Partition>>;

    /// Apply a transaction atomically.
    ///
    /// Fails with `AlreadyExists`, `ExperimentNotFound` or `VersionConflict`
    /// when the stored version does not match, and with `DuplicateTwoCharId`
    /// when a partition collides with another experiment. Nothing is written
    /// on failure.
    async fn commit(&self, tx: Transaction) -> Result<()>;
}

/// Persisted randomized assignments.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Look up the record for a selection key.
    async fn get_assignment(
        &self,
        selection_key: &str,
        experiment_id: ExperimentId,
    ) -> Result<Option<AssignmentRecord>>;

    /// Write the record unless one exists for the same key.
    async fn insert_if_absent(&self, record: AssignmentRecord) -> Result<InsertOutcome>;

    /// All records of an experiment.
    async fn list_assignments(&self, experiment_id: ExperimentId) -> Result<Vec<AssignmentRecord>>;

    /// Record (or refresh) a user's visit to a decision point.
    async fn record_visit(&self, visit: &DecisionPointVisit) -> Result<()>;

    /// All visits to an experiment's decision points.
    async fn list_visits(&self, experiment_id: ExperimentId) -> Result<Vec<DecisionPointVisit>>;
}

/// Explicit assignments and preview users.
#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// Get the assignment for `(user, experiment, scope)`.
    async fn get_explicit(
        &self,
        user_id: &UserId,
        experiment_id: ExperimentId,
        scope: OverrideScope,
    ) -> Result<Option<ExplicitAssignment>>;

    /// All assignments of a user in one scope.
    async fn list_explicit(
        &self,
        user_id: &UserId,
        scope: OverrideScope,
    ) -> Result<Vec<ExplicitAssignment>>;

    /// Insert or replace by id.
    ///
    /// Fails with `UniqueViolation` when another row already holds the same
    /// `(user, experiment, scope)`.
    async fn save_explicit(&self, assignment: &ExplicitAssignment) -> Result<()>;

    /// Delete by id. Returns whether a row was removed.
    async fn delete_explicit(&self, id: AssignmentId) -> Result<bool>;

    /// Whether `user_id` is a preview user.
    async fn is_preview(&self, user_id: &UserId) -> Result<bool>;

    /// Insert or replace a preview user row. `assignments` is ignored.
    async fn put_preview_user(&self, user: &PreviewUser) -> Result<()>;

    /// Get a preview user with its preview-scoped assignments.
    async fn get_preview_user(&self, user_id: &UserId) -> Result<Option<PreviewUser>>;

    /// Preview users ordered by creation, skipping `skip` and returning at
    /// most `take` (all when `None`).
    async fn list_preview_users(&self, skip: usize, take: Option<usize>)
    -> Result<Vec<PreviewUser>>;

    async fn count_preview_users(&self) -> Result<u64>;

    /// Delete a preview user and its preview-scoped assignments.
    async fn delete_preview_user(&self, user_id: &UserId) -> Result<Option<PreviewUser>>;
}
