//! Selection keys and the weighted draw.
//!
//! A selection key is `{subject}|{scope}`:
//!
//! | Unit       | Rule         | Subject                 | Scope                    |
//! |------------|--------------|-------------------------|--------------------------|
//! | individual | individual   | `user:{id}`             | `experiment:{id}`        |
//! | group      | group        | `group:{type}:{id}`     | `experiment:{id}`        |
//! | individual | experiment   | `user:{id}`             | `partition:{id}`         |
//! | group      | experiment   | `group:{type}:{id}`     | `partition:{id}`         |
//! | group      | individual   | `user:{id}`, seeded from the group key | `experiment:{id}` |

use crate::clock::RandomSource;
use crate::experiment::{AssignmentUnit, Condition, ConsistencyRule, Experiment, Partition};
use crate::types::PartitionId;

use super::types::{ExperimentUser, NoAssignmentReason};

/// Where a randomized assignment is stored for one user at one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPlan {
    pub key: String,
    /// Set for partition-scoped keys
    pub partition_id: Option<PartitionId>,
    pub seed: Seed,
}

/// Record a fresh assignment copies from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seed {
    /// Draw directly for the key
    None,
    /// Copy (or first create) the record under this group key
    Group(String),
    /// Would copy from a group, but the user belongs to none of the type
    MissingGroup,
}

/// Derive the selection plan for `user` at `partition`.
///
/// Fails with [`NoAssignmentReason::NoGroupMembership`] when the subject is a
/// group the user does not belong to.
pub fn plan(
    experiment: &Experiment,
    partition: &Partition,
    user: &ExperimentUser,
) -> Result<SelectionPlan, NoAssignmentReason> {
    let (scope, partition_id) = match experiment.consistency_rule {
        ConsistencyRule::Individual | ConsistencyRule::Group => {
            (format!("experiment:{}", experiment.id), None)
        }
        ConsistencyRule::Experiment => (
            format!("partition:{}", partition.id),
            Some(partition.id.clone()),
        ),
    };
    let user_subject = format!("user:{}", user.id);
    let group_subject = group_subject(experiment, user);

    let (subject, seed) = match (experiment.assignment_unit, experiment.consistency_rule) {
        (_, ConsistencyRule::Group) | (AssignmentUnit::Group, ConsistencyRule::Experiment) => {
            (group_subject.ok_or(NoAssignmentReason::NoGroupMembership)?, Seed::None)
        }
        (AssignmentUnit::Individual, _) => (user_subject, Seed::None),
        (AssignmentUnit::Group, ConsistencyRule::Individual) => {
            let seed = match group_subject {
                Some(group) => Seed::Group(format!("{group}|{scope}")),
                None => Seed::MissingGroup,
            };
            (user_subject, seed)
        }
    };

    Ok(SelectionPlan {
        key: format!("{subject}|{scope}"),
        partition_id,
        seed,
    })
}

fn group_subject(experiment: &Experiment, user: &ExperimentUser) -> Option<String> {
    let group_type = experiment.group_type.as_deref()?;
    let group_id = user.group(group_type)?;
    Some(format!("group:{group_type}:{group_id}"))
}

/// Pick a condition with probability proportional to its weight.
///
/// Draws uniformly in `[0, total)` and returns the first condition whose
/// cumulative weight exceeds the draw. `None` when every weight is zero.
pub fn weighted_draw<'a>(
    conditions: &'a [Condition],
    random: &dyn RandomSource,
) -> Option<&'a Condition> {
    let total: u64 = conditions
        .iter()
        .map(|c| u64::from(c.assignment_weight))
        .sum();
    if total == 0 {
        return None;
    }

    let draw = random.next_below(total);
    let mut cumulative = 0u64;
    conditions.iter().find(|c| {
        cumulative += u64::from(c.assignment_weight);
        cumulative > draw
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::clock::SeededRandom;
    use crate::experiment::{ExperimentRow, ExperimentState, PostExperimentRule};
    use crate::types::{ConditionId, ExperimentId};

    struct Scripted(Mutex<VecDeque<u64>>);

    impl Scripted {
        fn new(draws: &[u64]) -> Self {
            Self(Mutex::new(draws.iter().copied().collect()))
        }
    }

    impl RandomSource for Scripted {
        fn next_below(&self, bound: u64) -> u64 {
            let draw = self.0.lock().unwrap().pop_front().unwrap();
            assert!(draw < bound);
            draw
        }
    }

    fn condition(code: &str, weight: u32) -> Condition {
        let now = Utc::now();
        Condition {
            id: ConditionId::new(),
            experiment_id: ExperimentId::new(),
            code: code.to_string(),
            description: String::new(),
            assignment_weight: weight,
            two_character_id: code.to_string(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn experiment(unit: AssignmentUnit, rule: ConsistencyRule) -> (Experiment, Partition) {
        let now = Utc::now();
        let id = ExperimentId::new();
        let partition = Partition {
            id: PartitionId::compose(Some("lesson"), "W1"),
            experiment_id: id,
            exp_point: "W1".to_string(),
            exp_id: Some("lesson".to_string()),
            two_character_id: "P1".to_string(),
            description: String::new(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let row = ExperimentRow {
            id,
            name: "e".to_string(),
            description: String::new(),
            context: vec!["app".to_string()],
            state: ExperimentState::Enrolling,
            post_experiment_rule: PostExperimentRule::Continue,
            revert_to: None,
            assignment_unit: unit,
            consistency_rule: rule,
            group_type: (unit == AssignmentUnit::Group || rule == ConsistencyRule::Group)
                .then(|| "class".to_string()),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        (row.into_experiment(Vec::new(), vec![partition.clone()]), partition)
    }

    #[test]
    fn draw_walks_cumulative_weights() {
        let conditions = vec![condition("A", 70), condition("B", 30)];
        let random = Scripted::new(&[0, 69, 70, 99]);

        let picks: Vec<_> = (0..4)
            .map(|_| weighted_draw(&conditions, &random).unwrap().code.clone())
            .collect();

        assert_eq!(picks, vec!["A", "A", "B", "B"]);
    }

    #[test]
    fn zero_weight_conditions_are_never_drawn() {
        let conditions = vec![condition("A", 0), condition("B", 5), condition("C", 0)];
        let random = SeededRandom::new(1);
        for _ in 0..500 {
            assert_eq!(weighted_draw(&conditions, &random).unwrap().code, "B");
        }
    }

    #[test]
    fn all_zero_weights_draw_nothing() {
        let conditions = vec![condition("A", 0), condition("B", 0)];
        assert!(weighted_draw(&conditions, &SeededRandom::new(1)).is_none());
        assert!(weighted_draw(&[], &SeededRandom::new(1)).is_none());
    }

    #[test]
    fn draw_follows_weights() {
        let conditions = vec![condition("A", 70), condition("B", 30)];
        let random = SeededRandom::new(42);
        let a = (0..10_000)
            .filter(|_| weighted_draw(&conditions, &random).unwrap().code == "A")
            .count();
        let share = a as f64 / 10_000.0;
        assert!((share - 0.7).abs() < 0.03, "share of A was {share}");
    }

    #[test]
    fn individual_rule_keys_by_user_and_experiment() {
        let (exp, partition) = experiment(AssignmentUnit::Individual, ConsistencyRule::Individual);
        let plan = plan(&exp, &partition, &ExperimentUser::new("u1")).unwrap();
        assert_eq!(plan.key, format!("user:u1|experiment:{}", exp.id));
        assert_eq!(plan.partition_id, None);
        assert_eq!(plan.seed, Seed::None);
    }

    #[test]
    fn experiment_rule_keys_by_partition() {
        let (exp, partition) = experiment(AssignmentUnit::Individual, ConsistencyRule::Experiment);
        let plan = plan(&exp, &partition, &ExperimentUser::new("u1")).unwrap();
        assert_eq!(plan.key, "user:u1|partition:lesson_W1");
        assert_eq!(plan.partition_id, Some(partition.id));
    }

    #[test]
    fn group_rule_keys_by_group() {
        let (exp, partition) = experiment(AssignmentUnit::Group, ConsistencyRule::Group);
        let user = ExperimentUser::new("u1").with_group("class", "c-7");
        let plan = plan(&exp, &partition, &user).unwrap();
        assert_eq!(plan.key, format!("group:class:c-7|experiment:{}", exp.id));

        let loner = ExperimentUser::new("u2");
        assert_eq!(
            super::plan(&exp, &partition, &loner),
            Err(NoAssignmentReason::NoGroupMembership)
        );
    }

    #[test]
    fn group_unit_with_individual_rule_seeds_from_group() {
        let (exp, partition) = experiment(AssignmentUnit::Group, ConsistencyRule::Individual);
        let user = ExperimentUser::new("u1").with_group("class", "c-7");
        let plan = plan(&exp, &partition, &user).unwrap();
        assert_eq!(plan.key, format!("user:u1|experiment:{}", exp.id));
        assert_eq!(
            plan.seed,
            Seed::Group(format!("group:class:c-7|experiment:{}", exp.id))
        );

        let loner = super::plan(&exp, &partition, &ExperimentUser::new("u2")).unwrap();
        assert_eq!(loner.seed, Seed::MissingGroup);
    }
}
