//! Read-only support queries for operators.

use std::sync::Arc;

use tracing::info;

use crate::engine::{AssignmentEngine, DecisionPointAssignment, ExperimentUser};
use crate::error::Result;

pub struct SupportService {
    engine: Arc<AssignmentEngine>,
}

impl SupportService {
    pub fn new(engine: Arc<AssignmentEngine>) -> Self {
        Self { engine }
    }

    /// What `user` would get at every decision point in `context`.
    ///
    /// First resolutions still persist their assignment record. No visit
    /// is recorded.
    pub async fn get_assignments(
        &self,
        user: &ExperimentUser,
        context: &str,
    ) -> Result<Vec<DecisionPointAssignment>> {
        info!(user = %user.id, context, "support assignment lookup");
        self.engine
            .get_all_experiment_conditions(user, context, false)
            .await
    }
}
