//! Preview users: test identities that only see the conditions they are
//! given.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use super::{ExplicitAssignment, OverrideScope, PreviewAssignmentSpec, PreviewUser};
use crate::clock::Clock;
use crate::error::{Error, NotFound, Result};
use crate::storage::{ExperimentStore, OverrideStore};
use crate::types::{AssignmentId, UserId};
use crate::validation::Violation;

pub struct PreviewUsers {
    experiments: Arc<dyn ExperimentStore>,
    overrides: Arc<dyn OverrideStore>,
    clock: Arc<dyn Clock>,
}

impl PreviewUsers {
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

    pub async fn is_preview(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.overrides.is_preview(user_id).await?)
    }

    /// Register a preview user. Registering twice returns the existing user.
    pub async fn create(&self, user_id: &UserId) -> Result<PreviewUser> {
        if let Some(existing) = self.overrides.get_preview_user(user_id).await? {
            return Ok(existing);
        }
        let now = self.clock.now();
        let user = PreviewUser {
            id: user_id.clone(),
            created_at: now,
            updated_at: now,
            assignments: Vec::new(),
        };
        self.overrides.put_preview_user(&user).await?;
        info!(user = %user_id, "preview user created");
        Ok(user)
    }

    pub async fn find_one(&self, user_id: &UserId) -> Result<Option<PreviewUser>> {
        Ok(self.overrides.get_preview_user(user_id).await?)
    }

    pub async fn find(&self) -> Result<Vec<PreviewUser>> {
        Ok(self.overrides.list_preview_users(0, None).await?)
    }

    pub async fn find_paginated(&self, skip: usize, take: usize) -> Result<Vec<PreviewUser>> {
        Ok(self.overrides.list_preview_users(skip, Some(take)).await?)
    }

    pub async fn count(&self) -> Result<u64> {
        Ok(self.overrides.count_preview_users().await?)
    }

    /// Remove a preview user along with its preview assignments.
    pub async fn delete(&self, user_id: &UserId) -> Result<Option<PreviewUser>> {
        let deleted = self.overrides.delete_preview_user(user_id).await?;
        if let Some(user) = &deleted {
            info!(user = %user_id, assignments = user.assignments.len(), "preview user deleted");
        }
        Ok(deleted)
    }

    /// Replace the user's preview assignments with `specs`.
    ///
    /// Rows are matched by id. An entry without an id takes over the stored
    /// row for the same experiment unless another entry claims that row by
    /// id. Matched rows keep their id and creation time and are only written
    /// when their target changed; unmatched stored rows are deleted.
    ///
    /// Every check runs before the first write. The writes themselves are
    /// not one transaction.
    pub async fn set_assignments(
        &self,
        user_id: &UserId,
        specs: Vec<PreviewAssignmentSpec>,
    ) -> Result<PreviewUser> {
        let user = self
            .overrides
            .get_preview_user(user_id)
            .await?
            .ok_or_else(|| NotFound::PreviewUser(user_id.clone()))?;

        let mut seen = HashSet::new();
        let duplicates: Vec<Violation> = specs
            .iter()
            .filter(|s| !seen.insert(s.experiment_id))
            .map(|s| Violation::DuplicateOverride {
                experiment_id: s.experiment_id,
            })
            .collect();
        Error::check(duplicates)?;

        for spec in &specs {
            let experiment = self
                .experiments
                .get_experiment(spec.experiment_id)
                .await?
                .ok_or(NotFound::Experiment(spec.experiment_id))?;
            if experiment.condition(spec.condition_id).is_none() {
                return Err(NotFound::Condition {
                    experiment: spec.experiment_id,
                    condition: spec.condition_id,
                }
                .into());
            }
        }

        let stored = user.assignments;
        let claimed_by_id: HashSet<AssignmentId> = specs
            .iter()
            .filter_map(|s| s.id)
            .filter(|id| stored.iter().any(|a| a.id == *id))
            .collect();

        let mut kept = HashSet::new();
        let mut writes = Vec::new();
        let now = self.clock.now();
        for spec in &specs {
            let matched = match spec.id {
                Some(id) => stored.iter().find(|a| a.id == id),
                None => stored.iter().find(|a| {
                    a.experiment_id == spec.experiment_id
                        && !claimed_by_id.contains(&a.id)
                        && !kept.contains(&a.id)
                }),
            };
            match matched {
                Some(current) => {
                    kept.insert(current.id);
                    if current.experiment_id != spec.experiment_id
                        || current.condition_id != spec.condition_id
                    {
                        writes.push(ExplicitAssignment {
                            experiment_id: spec.experiment_id,
                            condition_id: spec.condition_id,
                            version: current.version + 1,
                            updated_at: now,
                            ..current.clone()
                        });
                    }
                }
                None => writes.push(ExplicitAssignment {
                    id: AssignmentId::new(),
                    user_id: user_id.clone(),
                    experiment_id: spec.experiment_id,
                    condition_id: spec.condition_id,
                    scope: OverrideScope::Preview,
                    version: 1,
                    created_at: now,
                    updated_at: now,
                }),
            }
        }

        let removed: Vec<_> = stored.iter().filter(|a| !kept.contains(&a.id)).collect();
        // Rows moving to another experiment release their old key before any save.
        let moved: Vec<_> = writes
            .iter()
            .filter(|w| {
                stored
                    .iter()
                    .any(|a| a.id == w.id && a.experiment_id != w.experiment_id)
            })
            .map(|w| w.id)
            .collect();
        for id in removed.iter().map(|a| a.id).chain(moved) {
            self.overrides.delete_explicit(id).await?;
        }
        for assignment in &writes {
            self.overrides.save_explicit(assignment).await?;
        }
        if !removed.is_empty() || !writes.is_empty() {
            self.overrides
                .put_preview_user(&PreviewUser {
                    id: user.id.clone(),
                    created_at: user.created_at,
                    updated_at: now,
                    assignments: Vec::new(),
                })
                .await?;
            info!(
                user = %user_id,
                removed = removed.len(),
                written = writes.len(),
                "preview assignments replaced"
            );
        }

        self.overrides
            .get_preview_user(user_id)
            .await?
            .ok_or_else(|| NotFound::PreviewUser(user_id.clone()).into())
    }
}
