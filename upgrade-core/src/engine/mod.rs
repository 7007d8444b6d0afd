//! Assignment resolution.
//!
//! [`AssignmentEngine`] decides which condition a user sees at a decision
//! point. The first matching rule wins:
//!
//! 1. Experiment not scoped to the context: no assignment
//! 2. Preview user: their preview override, never randomization
//! 3. Inactive or scheduled: not running
//! 4. Explicit individual override
//! 5. Demo: not running
//! 6. Enrolling: persisted weighted draw
//! 7. Enrollment complete: the post-experiment rule

mod selection;
mod types;

pub use selection::{SelectionPlan, Seed, weighted_draw};
pub use types::{
    AssignedCondition, AssignmentRecord, AssignmentSource, ConditionAssignment,
    DecisionPointAssignment, DecisionPointVisit, ExperimentUser, NoAssignmentReason, Resolution,
};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, RandomSource};
use crate::error::{NotFound, Result};
use crate::experiment::{Condition, Experiment, ExperimentState, Partition, PostExperimentRule};
use crate::overrides::OverrideScope;
use crate::storage::{AssignmentStore, ExperimentStore, InsertOutcome, OverrideStore};

/// One pass over a snapshot of the experiment.
enum Attempt {
    Resolved(Resolution),
    /// A condition or partition vanished under a concurrent edit
    Stale,
}

/// Resolves users to conditions.
pub struct AssignmentEngine {
    experiments: Arc<dyn ExperimentStore>,
    assignments: Arc<dyn AssignmentStore>,
    overrides: Arc<dyn OverrideStore>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
}

impl AssignmentEngine {
    pub fn new(
        experiments: Arc<dyn ExperimentStore>,
        assignments: Arc<dyn AssignmentStore>,
        overrides: Arc<dyn OverrideStore>,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            experiments,
            assignments,
            overrides,
            random,
            clock,
        }
    }

    /// Resolve `user` at the partition with this two-character id.
    ///
    /// Fails with `NotFound` when no partition has the id. Every other
    /// outcome, including "no condition", is a [`Resolution`].
    pub async fn resolve(
        &self,
        user: &ExperimentUser,
        context: &str,
        partition_two_char_id: &str,
    ) -> Result<Resolution> {
        let experiment = self
            .experiments
            .find_experiment_by_partition(partition_two_char_id)
            .await?
            .ok_or_else(|| NotFound::Partition(partition_two_char_id.to_string()))?;
        let is_preview = self.overrides.is_preview(&user.id).await?;
        self.resolve_with_retry(experiment, partition_two_char_id, user, context, is_preview)
            .await
    }

    /// Every assigned decision point of every experiment in `context`.
    pub async fn resolve_assignments(
        &self,
        user: &ExperimentUser,
        context: &str,
    ) -> Result<Vec<ConditionAssignment>> {
        let is_preview = self.overrides.is_preview(&user.id).await?;
        let resolutions = self.resolve_context(user, context, is_preview).await?;
        Ok(resolutions
            .into_iter()
            .filter_map(|(_, resolution)| match resolution {
                Resolution::Assigned(assignment) => Some(assignment),
                Resolution::NoAssignment { .. } => None,
            })
            .collect())
    }

    /// One entry per decision point of every experiment in `context`,
    /// assigned or not.
    ///
    /// With `mark_visited`, a visit is recorded for each entry unless the
    /// user is a preview user.
    pub async fn get_all_experiment_conditions(
        &self,
        user: &ExperimentUser,
        context: &str,
        mark_visited: bool,
    ) -> Result<Vec<DecisionPointAssignment>> {
        let is_preview = self.overrides.is_preview(&user.id).await?;
        let resolutions = self.resolve_context(user, context, is_preview).await?;

        let mut entries = Vec::with_capacity(resolutions.len());
        for (partition, resolution) in resolutions {
            if mark_visited && !is_preview {
                let visit = DecisionPointVisit {
                    user_id: user.id.clone(),
                    experiment_id: partition.experiment_id,
                    partition_id: partition.id.clone(),
                    condition_id: resolution.assignment().map(|a| a.condition.id),
                    visited_at: self.clock.now(),
                };
                self.assignments.record_visit(&visit).await?;
            }
            entries.push(DecisionPointAssignment::new(&partition, &resolution));
        }
        Ok(entries)
    }

    async fn resolve_context(
        &self,
        user: &ExperimentUser,
        context: &str,
        is_preview: bool,
    ) -> Result<Vec<(Partition, Resolution)>> {
        let experiments = self.experiments.list_experiments().await?;

        let mut resolutions = Vec::new();
        for experiment in experiments.into_iter().filter(|e| e.in_context(context)) {
            for partition in &experiment.partitions {
                let resolution = self
                    .resolve_with_retry(
                        experiment.clone(),
                        &partition.two_character_id,
                        user,
                        context,
                        is_preview,
                    )
                    .await?;
                resolutions.push((partition.clone(), resolution));
            }
        }
        debug!(user = %user.id, context, count = resolutions.len(), "resolved context");
        Ok(resolutions)
    }

    /// Resolve against `experiment`, re-reading it once if the first pass
    /// raced with a deletion.
    async fn resolve_with_retry(
        &self,
        mut experiment: Experiment,
        partition_two_char_id: &str,
        user: &ExperimentUser,
        context: &str,
        is_preview: bool,
    ) -> Result<Resolution> {
        for attempt in 0..2 {
            let Some(partition) = experiment.partition_by_two_char_id(partition_two_char_id)
            else {
                break;
            };
            match self
                .resolve_at(&experiment, partition, user, context, is_preview)
                .await?
            {
                Attempt::Resolved(resolution) => return Ok(resolution),
                Attempt::Stale if attempt == 0 => {
                    warn!(
                        experiment = %experiment.id,
                        partition = partition_two_char_id,
                        "experiment changed during resolution, re-reading"
                    );
                    match self
                        .experiments
                        .find_experiment_by_partition(partition_two_char_id)
                        .await?
                    {
                        Some(fresh) => experiment = fresh,
                        None => break,
                    }
                }
                Attempt::Stale => break,
            }
        }
        Ok(Resolution::none(NoAssignmentReason::Stale))
    }

    async fn resolve_at(
        &self,
        experiment: &Experiment,
        partition: &Partition,
        user: &ExperimentUser,
        context: &str,
        is_preview: bool,
    ) -> Result<Attempt> {
        if !experiment.in_context(context) {
            return Ok(Attempt::Resolved(Resolution::none(
                NoAssignmentReason::ContextMismatch,
            )));
        }

        if is_preview {
            let resolution = match self
                .explicit_condition(experiment, user, OverrideScope::Preview)
                .await?
            {
                Some(condition) => Resolution::Assigned(ConditionAssignment::new(
                    experiment,
                    partition,
                    condition,
                    AssignmentSource::Preview,
                )),
                None => Resolution::none(NoAssignmentReason::PreviewWithoutOverride),
            };
            return Ok(Attempt::Resolved(resolution));
        }

        if matches!(
            experiment.state,
            ExperimentState::Inactive | ExperimentState::Scheduled
        ) {
            return Ok(Attempt::Resolved(Resolution::none(
                NoAssignmentReason::NotRunning,
            )));
        }

        if let Some(condition) = self
            .explicit_condition(experiment, user, OverrideScope::Individual)
            .await?
        {
            debug!(user = %user.id, condition = %condition.code, "explicit override");
            return Ok(Attempt::Resolved(Resolution::Assigned(
                ConditionAssignment::new(experiment, partition, condition, AssignmentSource::Explicit),
            )));
        }

        match experiment.state {
            ExperimentState::Enrolling => self.randomize(experiment, partition, user).await,
            ExperimentState::EnrollmentComplete => {
                self.post_experiment(experiment, partition, user).await
            }
            ExperimentState::Inactive | ExperimentState::Scheduled | ExperimentState::Demo => Ok(
                Attempt::Resolved(Resolution::none(NoAssignmentReason::NotRunning)),
            ),
        }
    }

    /// The override condition, if the user has one that still exists.
    async fn explicit_condition<'a>(
        &self,
        experiment: &'a Experiment,
        user: &ExperimentUser,
        scope: OverrideScope,
    ) -> Result<Option<&'a Condition>> {
        let Some(assignment) = self
            .overrides
            .get_explicit(&user.id, experiment.id, scope)
            .await?
        else {
            return Ok(None);
        };
        let condition = experiment.condition(assignment.condition_id);
        if condition.is_none() {
            warn!(
                user = %user.id,
                condition = %assignment.condition_id,
                scope = scope.as_str(),
                "override points at a missing condition, ignoring"
            );
        }
        Ok(condition)
    }

    async fn randomize(
        &self,
        experiment: &Experiment,
        partition: &Partition,
        user: &ExperimentUser,
    ) -> Result<Attempt> {
        let plan = match selection::plan(experiment, partition, user) {
            Ok(plan) => plan,
            Err(reason) => return Ok(Attempt::Resolved(Resolution::none(reason))),
        };

        if let Some(record) = self
            .assignments
            .get_assignment(&plan.key, experiment.id)
            .await?
        {
            return Ok(from_record(experiment, partition, &record));
        }

        let condition_id = match &plan.seed {
            Seed::None => match weighted_draw(&experiment.conditions, self.random.as_ref()) {
                Some(condition) => condition.id,
                None => {
                    return Ok(Attempt::Resolved(Resolution::none(
                        NoAssignmentReason::NoEligibleCondition,
                    )));
                }
            },
            Seed::MissingGroup => {
                return Ok(Attempt::Resolved(Resolution::none(
                    NoAssignmentReason::NoGroupMembership,
                )));
            }
            Seed::Group(group_key) => {
                match self.group_record(experiment, group_key).await? {
                    Some(Ok(record)) => record.condition_id,
                    Some(Err(reason)) => {
                        return Ok(Attempt::Resolved(Resolution::none(reason)));
                    }
                    None => return Ok(Attempt::Stale),
                }
            }
        };

        let record = AssignmentRecord {
            selection_key: plan.key,
            experiment_id: experiment.id,
            partition_id: plan.partition_id,
            condition_id,
            created_at: self.clock.now(),
        };
        match self.assignments.insert_if_absent(record).await? {
            InsertOutcome::Inserted(record) => {
                debug!(key = %record.selection_key, condition = %record.condition_id, "new assignment");
                Ok(from_record(experiment, partition, &record))
            }
            InsertOutcome::Existing(record) => {
                debug!(key = %record.selection_key, "concurrent first resolution, using stored record");
                Ok(from_record(experiment, partition, &record))
            }
            InsertOutcome::Stale => Ok(Attempt::Stale),
        }
    }

    /// The group's record, drawing it first if the group has none.
    ///
    /// `None` when the drawn condition vanished before it was stored.
    async fn group_record(
        &self,
        experiment: &Experiment,
        group_key: &str,
    ) -> Result<Option<std::result::Result<AssignmentRecord, NoAssignmentReason>>> {
        if let Some(record) = self
            .assignments
            .get_assignment(group_key, experiment.id)
            .await?
        {
            return Ok(Some(Ok(record)));
        }
        let Some(condition) = weighted_draw(&experiment.conditions, self.random.as_ref()) else {
            return Ok(Some(Err(NoAssignmentReason::NoEligibleCondition)));
        };
        let record = AssignmentRecord {
            selection_key: group_key.to_string(),
            experiment_id: experiment.id,
            partition_id: None,
            condition_id: condition.id,
            created_at: self.clock.now(),
        };
        Ok(match self.assignments.insert_if_absent(record).await? {
            InsertOutcome::Inserted(record) | InsertOutcome::Existing(record) => Some(Ok(record)),
            InsertOutcome::Stale => None,
        })
    }

    async fn post_experiment(
        &self,
        experiment: &Experiment,
        partition: &Partition,
        user: &ExperimentUser,
    ) -> Result<Attempt> {
        match experiment.post_experiment_rule {
            PostExperimentRule::Continue => {
                let Ok(plan) = selection::plan(experiment, partition, user) else {
                    return Ok(Attempt::Resolved(Resolution::none(
                        NoAssignmentReason::EnrollmentComplete,
                    )));
                };
                match self
                    .assignments
                    .get_assignment(&plan.key, experiment.id)
                    .await?
                {
                    Some(record) => Ok(from_record(experiment, partition, &record)),
                    None => Ok(Attempt::Resolved(Resolution::none(
                        NoAssignmentReason::EnrollmentComplete,
                    ))),
                }
            }
            PostExperimentRule::RevertToDefault => Ok(Attempt::Resolved(Resolution::none(
                NoAssignmentReason::RevertedToDefault,
            ))),
            PostExperimentRule::Assign => {
                match experiment.revert_to.and_then(|id| experiment.condition(id)) {
                    Some(condition) => Ok(Attempt::Resolved(Resolution::Assigned(
                        ConditionAssignment::new(
                            experiment,
                            partition,
                            condition,
                            AssignmentSource::PostExperiment,
                        ),
                    ))),
                    None => {
                        warn!(experiment = %experiment.id, "assign rule without a revert condition");
                        Ok(Attempt::Resolved(Resolution::none(
                            NoAssignmentReason::RevertedToDefault,
                        )))
                    }
                }
            }
        }
    }
}

/// Map a stored record onto the snapshot; a missing condition means the
/// snapshot is older than the record.
fn from_record(experiment: &Experiment, partition: &Partition, record: &AssignmentRecord) -> Attempt {
    match experiment.condition(record.condition_id) {
        Some(condition) => Attempt::Resolved(Resolution::Assigned(ConditionAssignment::new(
            experiment,
            partition,
            condition,
            AssignmentSource::Randomized,
        ))),
        None => Attempt::Stale,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::{SeededRandom, SystemClock};
    use crate::experiment::{
        AssignmentUnit, ConsistencyRule, ExperimentRow, PostExperimentRule,
    };
    use crate::overrides::ExplicitAssignment;
    use crate::storage::{MemoryStore, Transaction, WriteOp};
    use crate::types::{AssignmentId, ConditionId, ExperimentId, PartitionId, UserId};

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: AssignmentEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let engine = AssignmentEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(SeededRandom::new(9)),
            Arc::new(SystemClock),
        );
        Fixture { store, engine }
    }

    fn condition(experiment_id: ExperimentId, code: &str, weight: u32, order: u32) -> Condition {
        let now = Utc::now();
        Condition {
            id: ConditionId::new(),
            experiment_id,
            code: code.to_string(),
            description: String::new(),
            assignment_weight: weight,
            two_character_id: format!("{code}{order}"),
            order,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed_experiment(
        store: &MemoryStore,
        state: ExperimentState,
        rule: PostExperimentRule,
        weights: &[(&str, u32)],
    ) -> Experiment {
        let now = Utc::now();
        let id = ExperimentId::new();
        let conditions: Vec<_> = weights
            .iter()
            .enumerate()
            .map(|(i, (code, weight))| condition(id, code, *weight, i as u32))
            .collect();
        let partition = Partition {
            id: PartitionId::compose(None, "W1"),
            experiment_id: id,
            exp_point: "W1".to_string(),
            exp_id: None,
            two_character_id: "P1".to_string(),
            description: String::new(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let row = ExperimentRow {
            id,
            name: "exp".to_string(),
            description: String::new(),
            context: vec!["app".to_string()],
            state,
            post_experiment_rule: rule,
            revert_to: conditions.last().map(|c| c.id),
            assignment_unit: AssignmentUnit::Individual,
            consistency_rule: ConsistencyRule::Individual,
            group_type: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let mut ops = vec![WriteOp::PutExperiment(row)];
        ops.extend(conditions.iter().cloned().map(WriteOp::UpsertCondition));
        ops.push(WriteOp::UpsertPartition(partition));
        store
            .commit(Transaction {
                experiment_id: id,
                expected_version: None,
                ops,
            })
            .await
            .unwrap();
        store.get_experiment(id).await.unwrap().unwrap()
    }

    async fn pin(store: &MemoryStore, user: &str, experiment: &Experiment, code: &str, scope: OverrideScope) {
        let condition = experiment.conditions.iter().find(|c| c.code == code).unwrap();
        let now = Utc::now();
        store
            .save_explicit(&ExplicitAssignment {
                id: AssignmentId::new(),
                user_id: UserId::from(user),
                experiment_id: experiment.id,
                condition_id: condition.id,
                scope,
                version: 1,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    fn reason(resolution: &Resolution) -> Option<NoAssignmentReason> {
        match resolution {
            Resolution::NoAssignment { reason } => Some(*reason),
            Resolution::Assigned(_) => None,
        }
    }

    #[tokio::test]
    async fn unknown_partition_is_not_found() {
        let f = fixture();
        let err = f
            .engine
            .resolve(&ExperimentUser::new("u1"), "app", "ZZ")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotFound(NotFound::Partition(_))));
    }

    #[tokio::test]
    async fn other_context_gets_no_assignment() {
        let f = fixture();
        seed_experiment(&f.store, ExperimentState::Enrolling, PostExperimentRule::Continue, &[("A", 50)]).await;

        let resolution = f.engine.resolve(&ExperimentUser::new("u1"), "web", "P1").await.unwrap();

        assert_eq!(reason(&resolution), Some(NoAssignmentReason::ContextMismatch));
    }

    #[tokio::test]
    async fn repeated_resolution_returns_same_condition() {
        let f = fixture();
        seed_experiment(
            &f.store,
            ExperimentState::Enrolling,
            PostExperimentRule::Continue,
            &[("A", 50), ("B", 50)],
        )
        .await;
        let user = ExperimentUser::new("u1");

        let first = f.engine.resolve(&user, "app", "P1").await.unwrap();
        for _ in 0..20 {
            let again = f.engine.resolve(&user, "app", "P1").await.unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(first.assignment().unwrap().source, AssignmentSource::Randomized);
    }

    #[tokio::test]
    async fn inactive_and_scheduled_are_not_running() {
        for state in [ExperimentState::Inactive, ExperimentState::Scheduled] {
            let f = fixture();
            let exp = seed_experiment(&f.store, state, PostExperimentRule::Continue, &[("A", 50)]).await;
            pin(&f.store, "u1", &exp, "A", OverrideScope::Individual).await;

            let resolution = f.engine.resolve(&ExperimentUser::new("u1"), "app", "P1").await.unwrap();

            assert_eq!(reason(&resolution), Some(NoAssignmentReason::NotRunning));
        }
    }

    #[tokio::test]
    async fn demo_serves_overrides_only() {
        let f = fixture();
        let exp = seed_experiment(&f.store, ExperimentState::Demo, PostExperimentRule::Continue, &[("A", 50), ("B", 50)]).await;
        pin(&f.store, "u1", &exp, "B", OverrideScope::Individual).await;

        let pinned = f.engine.resolve(&ExperimentUser::new("u1"), "app", "P1").await.unwrap();
        let other = f.engine.resolve(&ExperimentUser::new("u9"), "app", "P1").await.unwrap();

        assert_eq!(pinned.condition_code(), Some("B"));
        assert_eq!(reason(&other), Some(NoAssignmentReason::NotRunning));
        assert!(f.store.list_assignments(exp.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_override_beats_stored_record() {
        let f = fixture();
        let exp = seed_experiment(
            &f.store,
            ExperimentState::Enrolling,
            PostExperimentRule::Continue,
            &[("A", 100), ("B", 0)],
        )
        .await;
        let user = ExperimentUser::new("u1");
        assert_eq!(f.engine.resolve(&user, "app", "P1").await.unwrap().condition_code(), Some("A"));

        pin(&f.store, "u1", &exp, "B", OverrideScope::Individual).await;
        let resolution = f.engine.resolve(&user, "app", "P1").await.unwrap();

        assert_eq!(resolution.condition_code(), Some("B"));
        assert_eq!(resolution.assignment().unwrap().source, AssignmentSource::Explicit);
    }

    #[tokio::test]
    async fn preview_users_never_randomize() {
        let f = fixture();
        let exp = seed_experiment(
            &f.store,
            ExperimentState::Inactive,
            PostExperimentRule::Continue,
            &[("A", 50), ("B", 50)],
        )
        .await;
        let now = Utc::now();
        for id in ["p1", "p2"] {
            f.store
                .put_preview_user(&crate::overrides::PreviewUser {
                    id: id.into(),
                    created_at: now,
                    updated_at: now,
                    assignments: Vec::new(),
                })
                .await
                .unwrap();
        }
        pin(&f.store, "p1", &exp, "B", OverrideScope::Preview).await;

        let with = f.engine.resolve(&ExperimentUser::new("p1"), "app", "P1").await.unwrap();
        let without = f.engine.resolve(&ExperimentUser::new("p2"), "app", "P1").await.unwrap();

        assert_eq!(with.condition_code(), Some("B"));
        assert_eq!(with.assignment().unwrap().source, AssignmentSource::Preview);
        assert_eq!(reason(&without), Some(NoAssignmentReason::PreviewWithoutOverride));
    }

    #[tokio::test]
    async fn zero_total_weight_is_no_eligible_condition() {
        let f = fixture();
        seed_experiment(&f.store, ExperimentState::Enrolling, PostExperimentRule::Continue, &[("A", 0)]).await;

        let resolution = f.engine.resolve(&ExperimentUser::new("u1"), "app", "P1").await.unwrap();

        assert_eq!(reason(&resolution), Some(NoAssignmentReason::NoEligibleCondition));
    }

    #[tokio::test]
    async fn post_experiment_rules() {
        let f = fixture();
        let exp = seed_experiment(
            &f.store,
            ExperimentState::Enrolling,
            PostExperimentRule::Continue,
            &[("A", 100), ("B", 0)],
        )
        .await;
        let enrolled = ExperimentUser::new("u1");
        f.engine.resolve(&enrolled, "app", "P1").await.unwrap();

        let set = |state, rule| {
            let store = f.store.clone();
            let mut row = exp.row();
            async move {
                let current = store.get_experiment(row.id).await.unwrap().unwrap();
                row.state = state;
                row.post_experiment_rule = rule;
                row.version = current.version + 1;
                store
                    .commit(Transaction {
                        experiment_id: row.id,
                        expected_version: Some(current.version),
                        ops: vec![WriteOp::PutExperiment(row)],
                    })
                    .await
                    .unwrap();
            }
        };

        set(ExperimentState::EnrollmentComplete, PostExperimentRule::Continue).await;
        let kept = f.engine.resolve(&enrolled, "app", "P1").await.unwrap();
        let late = f.engine.resolve(&ExperimentUser::new("u2"), "app", "P1").await.unwrap();
        assert_eq!(kept.condition_code(), Some("A"));
        assert_eq!(reason(&late), Some(NoAssignmentReason::EnrollmentComplete));

        set(ExperimentState::EnrollmentComplete, PostExperimentRule::RevertToDefault).await;
        let reverted = f.engine.resolve(&enrolled, "app", "P1").await.unwrap();
        assert_eq!(reason(&reverted), Some(NoAssignmentReason::RevertedToDefault));

        set(ExperimentState::EnrollmentComplete, PostExperimentRule::Assign).await;
        let forced = f.engine.resolve(&enrolled, "app", "P1").await.unwrap();
        assert_eq!(forced.condition_code(), Some("B"));
        assert_eq!(forced.assignment().unwrap().source, AssignmentSource::PostExperiment);
    }

    #[tokio::test]
    async fn marking_visits_skips_preview_users() {
        let f = fixture();
        let exp = seed_experiment(&f.store, ExperimentState::Enrolling, PostExperimentRule::Continue, &[("A", 100)]).await;
        let now = Utc::now();
        f.store
            .put_preview_user(&crate::overrides::PreviewUser {
                id: "p1".into(),
                created_at: now,
                updated_at: now,
                assignments: Vec::new(),
            })
            .await
            .unwrap();

        let entries = f
            .engine
            .get_all_experiment_conditions(&ExperimentUser::new("u1"), "app", true)
            .await
            .unwrap();
        f.engine
            .get_all_experiment_conditions(&ExperimentUser::new("p1"), "app", true)
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].condition.as_ref().map(|c| c.code.as_str()), Some("A"));
        let visits = f.store.list_visits(exp.id).await.unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].user_id.as_str(), "u1");
    }
}
