//! Turso/libSQL implementation of the storage traits.
//!
//! It can connect to:
//! - Remote Turso database (cloud)
//! - Local embedded SQLite file
//!
//! All statements go through one connection. Transactions open with
//! `BEGIN IMMEDIATE` so concurrent processes sharing a file serialize their
//! writes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    AssignmentStore, Error, ExperimentStore, InsertOutcome, OverrideStore, Result, Transaction,
    WriteOp,
};
use crate::engine::{AssignmentRecord, DecisionPointVisit};
use crate::experiment::{
    AssignmentUnit, Condition, ConsistencyRule, Experiment, ExperimentRow, ExperimentState,
    Partition, PostExperimentRule,
};
use crate::overrides::{ExplicitAssignment, OverrideScope, PreviewUser};
use crate::types::{AssignmentId, ConditionId, ExperimentId, PartitionId, UserId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    context TEXT NOT NULL,
    state TEXT NOT NULL,
    post_experiment_rule TEXT NOT NULL,
    revert_to TEXT,
    assignment_unit TEXT NOT NULL,
    consistency_rule TEXT NOT NULL,
    group_type TEXT,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conditions (
    id TEXT PRIMARY KEY,
    experiment_id TEXT NOT NULL,
    code TEXT NOT NULL,
    description TEXT NOT NULL,
    assignment_weight INTEGER NOT NULL,
    two_character_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (experiment_id, two_character_id)
);

CREATE TABLE IF NOT EXISTS partitions (
    id TEXT PRIMARY KEY,
    experiment_id TEXT NOT NULL,
    exp_point TEXT NOT NULL,
    exp_id TEXT,
    two_character_id TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    position INTEGER NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS explicit_assignments (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    experiment_id TEXT NOT NULL,
    condition_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, experiment_id, scope)
);

CREATE TABLE IF NOT EXISTS preview_users (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assignments (
    selection_key TEXT NOT NULL,
    experiment_id TEXT NOT NULL,
    partition_id TEXT,
    condition_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (selection_key, experiment_id)
);

CREATE TABLE IF NOT EXISTS decision_point_visits (
    user_id TEXT NOT NULL,
    experiment_id TEXT NOT NULL,
    partition_id TEXT NOT NULL,
    condition_id TEXT,
    visited_at TEXT NOT NULL,
    PRIMARY KEY (user_id, partition_id)
);

CREATE INDEX IF NOT EXISTS idx_conditions_experiment ON conditions(experiment_id);
CREATE INDEX IF NOT EXISTS idx_partitions_experiment ON partitions(experiment_id);
CREATE INDEX IF NOT EXISTS idx_assignments_condition ON assignments(condition_id);
CREATE INDEX IF NOT EXISTS idx_explicit_condition ON explicit_assignments(condition_id);
"#;

const EXPERIMENT_COLUMNS: &str = "id, name, description, context, state, post_experiment_rule, revert_to, assignment_unit, consistency_rule, group_type, version, created_at, updated_at";
const CONDITION_COLUMNS: &str = "id, experiment_id, code, description, assignment_weight, two_character_id, position, version, created_at, updated_at";
const PARTITION_COLUMNS: &str = "id, experiment_id, exp_point, exp_id, two_character_id, description, position, version, created_at, updated_at";
const EXPLICIT_COLUMNS: &str =
    "id, user_id, experiment_id, condition_id, scope, version, created_at, updated_at";
const ASSIGNMENT_COLUMNS: &str =
    "selection_key, experiment_id, partition_id, condition_id, created_at";

/// Turso-backed store for experiments, assignments and overrides.
#[derive(Clone)]
pub struct TursoStore {
    conn: Arc<Mutex<Connection>>,
}

impl TursoStore {
    /// Create a new store with a local embedded database, creating its
    /// parent directory when missing.
    pub async fn new_local(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new_local(path).build().await?;
        Self::open(db.connect()?).await
    }

    /// Create a new store connected to a remote Turso database.
    pub async fn new_remote(url: &str, token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), token.to_string())
            .build()
            .await?;
        Self::open(db.connect()?).await
    }

    /// Create a new in-memory store (for testing).
    pub async fn new_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::open(db.connect()?).await
    }

    async fn open(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn parse_row(row: &libsql::Row) -> Result<ExperimentRow> {
        let id: String = row.get(0)?;
        let context: String = row.get(3)?;
        let state: String = row.get(4)?;
        let rule: String = row.get(5)?;
        let revert_to: Option<String> = row.get(6)?;
        let unit: String = row.get(7)?;
        let consistency: String = row.get(8)?;
        let created_at: String = row.get(11)?;
        let updated_at: String = row.get(12)?;

        Ok(ExperimentRow {
            id: ExperimentId(parse_uuid(&id, "experiment id")?),
            name: row.get(1)?,
            description: row.get(2)?,
            context: serde_json::from_str(&context)?,
            state: ExperimentState::parse(&state)
                .ok_or_else(|| Error::InvalidData(format!("invalid state: {}", state)))?,
            post_experiment_rule: PostExperimentRule::parse(&rule).ok_or_else(|| {
                Error::InvalidData(format!("invalid post-experiment rule: {}", rule))
            })?,
            revert_to: revert_to
                .as_deref()
                .map(|s| parse_uuid(s, "condition id").map(ConditionId))
                .transpose()?,
            assignment_unit: AssignmentUnit::parse(&unit)
                .ok_or_else(|| Error::InvalidData(format!("invalid assignment unit: {}", unit)))?,
            consistency_rule: ConsistencyRule::parse(&consistency).ok_or_else(|| {
                Error::InvalidData(format!("invalid consistency rule: {}", consistency))
            })?,
            group_type: row.get(9)?,
            version: row.get::<i64>(10)? as u64,
            created_at: parse_datetime(&created_at)?,
            updated_at: parse_datetime(&updated_at)?,
        })
    }

    fn parse_condition(row: &libsql::Row) -> Result<Condition> {
        let id: String = row.get(0)?;
        let experiment_id: String = row.get(1)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Condition {
            id: ConditionId(parse_uuid(&id, "condition id")?),
            experiment_id: ExperimentId(parse_uuid(&experiment_id, "experiment id")?),
            code: row.get(2)?,
            description: row.get(3)?,
            assignment_weight: row.get::<i64>(4)? as u32,
            two_character_id: row.get(5)?,
            order: row.get::<i64>(6)? as u32,
            version: row.get::<i64>(7)? as u64,
            created_at: parse_datetime(&created_at)?,
            updated_at: parse_datetime(&updated_at)?,
        })
    }

    fn parse_partition(row: &libsql::Row) -> Result<Partition> {
        let experiment_id: String = row.get(1)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Partition {
            id: PartitionId(row.get(0)?),
            experiment_id: ExperimentId(parse_uuid(&experiment_id, "experiment id")?),
            exp_point: row.get(2)?,
            exp_id: row.get(3)?,
            two_character_id: row.get(4)?,
            description: row.get(5)?,
            order: row.get::<i64>(6)? as u32,
            version: row.get::<i64>(7)? as u64,
            created_at: parse_datetime(&created_at)?,
            updated_at: parse_datetime(&updated_at)?,
        })
    }

    fn parse_explicit(row: &libsql::Row) -> Result<ExplicitAssignment> {
        let id: String = row.get(0)?;
        let experiment_id: String = row.get(2)?;
        let condition_id: String = row.get(3)?;
        let scope: String = row.get(4)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;

        Ok(ExplicitAssignment {
            id: AssignmentId(parse_uuid(&id, "assignment id")?),
            user_id: UserId(row.get(1)?),
            experiment_id: ExperimentId(parse_uuid(&experiment_id, "experiment id")?),
            condition_id: ConditionId(parse_uuid(&condition_id, "condition id")?),
            scope: OverrideScope::parse(&scope)
                .ok_or_else(|| Error::InvalidData(format!("invalid scope: {}", scope)))?,
            version: row.get::<i64>(5)? as u64,
            created_at: parse_datetime(&created_at)?,
            updated_at: parse_datetime(&updated_at)?,
        })
    }

    fn parse_assignment(row: &libsql::Row) -> Result<AssignmentRecord> {
        let experiment_id: String = row.get(1)?;
        let partition_id: Option<String> = row.get(2)?;
        let condition_id: String = row.get(3)?;
        let created_at: String = row.get(4)?;

        Ok(AssignmentRecord {
            selection_key: row.get(0)?,
            experiment_id: ExperimentId(parse_uuid(&experiment_id, "experiment id")?),
            partition_id: partition_id.map(PartitionId),
            condition_id: ConditionId(parse_uuid(&condition_id, "condition id")?),
            created_at: parse_datetime(&created_at)?,
        })
    }

    fn parse_visit(row: &libsql::Row) -> Result<DecisionPointVisit> {
        let experiment_id: String = row.get(1)?;
        let condition_id: Option<String> = row.get(3)?;
        let visited_at: String = row.get(4)?;

        Ok(DecisionPointVisit {
            user_id: UserId(row.get(0)?),
            experiment_id: ExperimentId(parse_uuid(&experiment_id, "experiment id")?),
            partition_id: PartitionId(row.get(2)?),
            condition_id: condition_id
                .as_deref()
                .map(|s| parse_uuid(s, "condition id").map(ConditionId))
                .transpose()?,
            visited_at: parse_datetime(&visited_at)?,
        })
    }

    fn parse_preview_user(row: &libsql::Row) -> Result<PreviewUser> {
        let created_at: String = row.get(1)?;
        let updated_at: String = row.get(2)?;
        Ok(PreviewUser {
            id: UserId(row.get(0)?),
            created_at: parse_datetime(&created_at)?,
            updated_at: parse_datetime(&updated_at)?,
            assignments: Vec::new(),
        })
    }

    async fn load_experiment(conn: &Connection, id: ExperimentId) -> Result<Option<Experiment>> {
        let mut rows = conn
            .query(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?"),
                [id.0.to_string()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let row = Self::parse_row(&row)?;

        let mut conditions = Vec::new();
        let mut rows = conn
            .query(
                &format!("SELECT {CONDITION_COLUMNS} FROM conditions WHERE experiment_id = ?"),
                [id.0.to_string()],
            )
            .await?;
        while let Some(r) = rows.next().await? {
            conditions.push(Self::parse_condition(&r)?);
        }

        let mut partitions = Vec::new();
        let mut rows = conn
            .query(
                &format!("SELECT {PARTITION_COLUMNS} FROM partitions WHERE experiment_id = ?"),
                [id.0.to_string()],
            )
            .await?;
        while let Some(r) = rows.next().await? {
            partitions.push(Self::parse_partition(&r)?);
        }

        Ok(Some(row.into_experiment(conditions, partitions)))
    }

    async fn load_preview_assignments(
        conn: &Connection,
        user_id: &UserId,
    ) -> Result<Vec<ExplicitAssignment>> {
        Self::query_explicit(conn, user_id, OverrideScope::Preview).await
    }

    async fn query_explicit(
        conn: &Connection,
        user_id: &UserId,
        scope: OverrideScope,
    ) -> Result<Vec<ExplicitAssignment>> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXPLICIT_COLUMNS} FROM explicit_assignments WHERE user_id = ? AND scope = ? ORDER BY created_at, id"
                ),
                libsql::params![user_id.as_str(), scope.as_str()],
            )
            .await?;
        let mut assignments = Vec::new();
        while let Some(row) = rows.next().await? {
            assignments.push(Self::parse_explicit(&row)?);
        }
        Ok(assignments)
    }

    async fn stored_version(conn: &Connection, id: ExperimentId) -> Result<Option<u64>> {
        let mut rows = conn
            .query(
                "SELECT version FROM experiments WHERE id = ?",
                [id.0.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)? as u64)),
            None => Ok(None),
        }
    }

    async fn apply_transaction(conn: &Connection, tx: Transaction) -> Result<()> {
        let stored = Self::stored_version(conn, tx.experiment_id).await?;
        match (tx.expected_version, stored) {
            (None, Some(_)) => return Err(Error::AlreadyExists(tx.experiment_id)),
            (Some(_), None) => return Err(Error::ExperimentNotFound(tx.experiment_id)),
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(Error::VersionConflict { expected, actual });
            }
            _ => {}
        }

        for op in tx.ops {
            Self::apply_op(conn, op).await?;
        }
        Ok(())
    }

    async fn apply_op(conn: &Connection, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::PurgeOverridesForCondition(id) => {
                conn.execute(
                    "DELETE FROM explicit_assignments WHERE condition_id = ?",
                    [id.0.to_string()],
                )
                .await?;
            }
            WriteOp::PurgeOverridesForExperiment(id) => {
                conn.execute(
                    "DELETE FROM explicit_assignments WHERE experiment_id = ?",
                    [id.0.to_string()],
                )
                .await?;
            }
            WriteOp::PurgeAssignmentsForCondition(id) => {
                conn.execute(
                    "DELETE FROM assignments WHERE condition_id = ?",
                    [id.0.to_string()],
                )
                .await?;
            }
            WriteOp::PurgeAssignmentsForPartition(id) => {
                conn.execute(
                    "DELETE FROM assignments WHERE partition_id = ?",
                    [id.as_str()],
                )
                .await?;
                conn.execute(
                    "DELETE FROM decision_point_visits WHERE partition_id = ?",
                    [id.as_str()],
                )
                .await?;
            }
            WriteOp::PurgeAssignmentsForExperiment(id) => {
                conn.execute(
                    "DELETE FROM assignments WHERE experiment_id = ?",
                    [id.0.to_string()],
                )
                .await?;
                conn.execute(
                    "DELETE FROM decision_point_visits WHERE experiment_id = ?",
                    [id.0.to_string()],
                )
                .await?;
            }
            WriteOp::DeletePartition(id) => {
                conn.execute("DELETE FROM partitions WHERE id = ?", [id.as_str()])
                    .await?;
            }
            WriteOp::DeleteCondition(id) => {
                conn.execute("DELETE FROM conditions WHERE id = ?", [id.0.to_string()])
                    .await?;
            }
            WriteOp::UpsertCondition(condition) => {
                Self::check_owner(conn, "conditions", &condition.id.0.to_string(), condition.experiment_id)
                    .await?;
                conn.execute(
                    &format!(
                        "INSERT INTO conditions ({CONDITION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET code = excluded.code, description = excluded.description,
                         assignment_weight = excluded.assignment_weight, two_character_id = excluded.two_character_id,
                         position = excluded.position, version = excluded.version, updated_at = excluded.updated_at"
                    ),
                    libsql::params![
                        condition.id.0.to_string(),
                        condition.experiment_id.0.to_string(),
                        condition.code,
                        condition.description,
                        condition.assignment_weight as i64,
                        condition.two_character_id,
                        condition.order as i64,
                        condition.version as i64,
                        format_datetime(condition.created_at),
                        format_datetime(condition.updated_at)
                    ],
                )
                .await
                .map_err(unique_violation)?;
            }
            WriteOp::UpsertPartition(partition) => {
                let mut rows = conn
                    .query(
                        "SELECT experiment_id FROM partitions WHERE two_character_id = ? AND id != ?",
                        libsql::params![partition.two_character_id.as_str(), partition.id.as_str()],
                    )
                    .await?;
                if let Some(row) = rows.next().await? {
                    let owner: String = row.get(0)?;
                    let owner = ExperimentId(parse_uuid(&owner, "experiment id")?);
                    if owner != partition.experiment_id {
                        return Err(Error::DuplicateTwoCharId {
                            two_character_id: partition.two_character_id,
                            experiment_id: owner,
                        });
                    }
                }
                Self::check_owner(conn, "partitions", partition.id.as_str(), partition.experiment_id)
                    .await?;
                conn.execute(
                    &format!(
                        "INSERT INTO partitions ({PARTITION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET exp_point = excluded.exp_point, exp_id = excluded.exp_id,
                         two_character_id = excluded.two_character_id, description = excluded.description,
                         position = excluded.position, version = excluded.version, updated_at = excluded.updated_at"
                    ),
                    libsql::params![
                        partition.id.as_str(),
                        partition.experiment_id.0.to_string(),
                        partition.exp_point,
                        partition.exp_id,
                        partition.two_character_id,
                        partition.description,
                        partition.order as i64,
                        partition.version as i64,
                        format_datetime(partition.created_at),
                        format_datetime(partition.updated_at)
                    ],
                )
                .await
                .map_err(unique_violation)?;
            }
            WriteOp::PutExperiment(row) => {
                debug!(id = %row.id, version = row.version, "writing experiment row");
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO experiments ({EXPERIMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                    ),
                    libsql::params![
                        row.id.0.to_string(),
                        row.name,
                        row.description,
                        serde_json::to_string(&row.context)?,
                        row.state.as_str(),
                        row.post_experiment_rule.as_str(),
                        row.revert_to.map(|id| id.0.to_string()),
                        row.assignment_unit.as_str(),
                        row.consistency_rule.as_str(),
                        row.group_type,
                        row.version as i64,
                        format_datetime(row.created_at),
                        format_datetime(row.updated_at)
                    ],
                )
                .await?;
            }
            WriteOp::DeleteExperiment(id) => {
                conn.execute("DELETE FROM experiments WHERE id = ?", [id.0.to_string()])
                    .await?;
            }
        }
        Ok(())
    }

    /// Reject an upsert that would move a child row to another experiment.
    async fn check_owner(
        conn: &Connection,
        table: &str,
        id: &str,
        experiment_id: ExperimentId,
    ) -> Result<()> {
        let mut rows = conn
            .query(
                &format!("SELECT experiment_id FROM {table} WHERE id = ?"),
                [id],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let owner: String = row.get(0)?;
            if owner != experiment_id.0.to_string() {
                return Err(Error::UniqueViolation(format!("{table} id {id}")));
            }
        }
        Ok(())
    }

    async fn insert_record(conn: &Connection, record: AssignmentRecord) -> Result<InsertOutcome> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE selection_key = ? AND experiment_id = ?"
                ),
                libsql::params![record.selection_key.as_str(), record.experiment_id.0.to_string()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            return Ok(InsertOutcome::Existing(Self::parse_assignment(&row)?));
        }

        let mut rows = conn
            .query(
                "SELECT 1 FROM conditions WHERE id = ? AND experiment_id = ?",
                libsql::params![
                    record.condition_id.0.to_string(),
                    record.experiment_id.0.to_string()
                ],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Ok(InsertOutcome::Stale);
        }
        if let Some(partition_id) = &record.partition_id {
            let mut rows = conn
                .query("SELECT 1 FROM partitions WHERE id = ?", [partition_id.as_str()])
                .await?;
            if rows.next().await?.is_none() {
                return Ok(InsertOutcome::Stale);
            }
        }

        conn.execute(
            &format!("INSERT INTO assignments ({ASSIGNMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?)"),
            libsql::params![
                record.selection_key.as_str(),
                record.experiment_id.0.to_string(),
                record.partition_id.as_ref().map(|p| p.as_str().to_string()),
                record.condition_id.0.to_string(),
                format_datetime(record.created_at)
            ],
        )
        .await?;
        Ok(InsertOutcome::Inserted(record))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ()).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl ExperimentStore for TursoStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN", ()).await?;
        let result = Self::load_experiment(&conn, id).await;
        finish(&conn, result).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN", ()).await?;
        let result: Result<Vec<Experiment>> = async {
            let mut rows = conn
                .query("SELECT id FROM experiments ORDER BY created_at, id", ())
                .await?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next().await? {
                let id: String = row.get(0)?;
                ids.push(ExperimentId(parse_uuid(&id, "experiment id")?));
            }

            let mut experiments = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(experiment) = Self::load_experiment(&conn, id).await? {
                    experiments.push(experiment);
                }
            }
            Ok(experiments)
        }
        .await;
        finish(&conn, result).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_experiment_by_partition(
        &self,
        two_char_id: &str,
    ) -> Result<Option<Experiment>> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN", ()).await?;
        let result: Result<Option<Experiment>> = async {
            let mut rows = conn
                .query(
                    "SELECT experiment_id FROM partitions WHERE two_character_id = ?",
                    [two_char_id],
                )
                .await?;
            let Some(row) = rows.next().await? else {
                return Ok(None);
            };
            let id: String = row.get(0)?;
            let id = ExperimentId(parse_uuid(&id, "experiment id")?);
            Self::load_experiment(&conn, id).await
        }
        .await;
        finish(&conn, result).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_partition_by_two_char_id(&self, two_char_id: &str) -> Result<Option<Partition>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {PARTITION_COLUMNS} FROM partitions WHERE two_character_id = ?"),
                [two_char_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_partition(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_partitions(&self) -> Result<Vec<Partition>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {PARTITION_COLUMNS} FROM partitions ORDER BY id"),
                (),
            )
            .await?;
        let mut partitions = Vec::new();
        while let Some(row) = rows.next().await? {
            partitions.push(Self::parse_partition(&row)?);
        }
        Ok(partitions)
    }

    #[instrument(skip(self, tx), fields(experiment = %tx.experiment_id, ops = tx.ops.len()), level = "debug")]
    async fn commit(&self, tx: Transaction) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = Self::apply_transaction(&conn, tx).await;
        finish(&conn, result).await
    }
}

#[async_trait]
impl AssignmentStore for TursoStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_assignment(
        &self,
        selection_key: &str,
        experiment_id: ExperimentId,
    ) -> Result<Option<AssignmentRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE selection_key = ? AND experiment_id = ?"
                ),
                libsql::params![selection_key, experiment_id.0.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_assignment(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, record), fields(key = %record.selection_key), level = "debug")]
    async fn insert_if_absent(&self, record: AssignmentRecord) -> Result<InsertOutcome> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = Self::insert_record(&conn, record).await;
        finish(&conn, result).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_assignments(&self, experiment_id: ExperimentId) -> Result<Vec<AssignmentRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE experiment_id = ? ORDER BY selection_key"
                ),
                [experiment_id.0.to_string()],
            )
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_assignment(&row)?);
        }
        Ok(records)
    }

    #[instrument(skip(self, visit), fields(user = %visit.user_id, partition = %visit.partition_id), level = "debug")]
    async fn record_visit(&self, visit: &DecisionPointVisit) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO decision_point_visits (user_id, experiment_id, partition_id, condition_id, visited_at)
             SELECT ?1, ?2, ?3, ?4, ?5 WHERE EXISTS (SELECT 1 FROM partitions WHERE id = ?3)
             ON CONFLICT(user_id, partition_id) DO UPDATE SET condition_id = excluded.condition_id,
             visited_at = excluded.visited_at",
            libsql::params![
                visit.user_id.as_str(),
                visit.experiment_id.0.to_string(),
                visit.partition_id.as_str(),
                visit.condition_id.map(|id| id.0.to_string()),
                format_datetime(visit.visited_at)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_visits(&self, experiment_id: ExperimentId) -> Result<Vec<DecisionPointVisit>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT user_id, experiment_id, partition_id, condition_id, visited_at FROM decision_point_visits WHERE experiment_id = ? ORDER BY partition_id, user_id",
                [experiment_id.0.to_string()],
            )
            .await?;
        let mut visits = Vec::new();
        while let Some(row) = rows.next().await? {
            visits.push(Self::parse_visit(&row)?);
        }
        Ok(visits)
    }
}

#[async_trait]
impl OverrideStore for TursoStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_explicit(
        &self,
        user_id: &UserId,
        experiment_id: ExperimentId,
        scope: OverrideScope,
    ) -> Result<Option<ExplicitAssignment>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXPLICIT_COLUMNS} FROM explicit_assignments WHERE user_id = ? AND experiment_id = ? AND scope = ?"
                ),
                libsql::params![
                    user_id.as_str(),
                    experiment_id.0.to_string(),
                    scope.as_str()
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_explicit(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_explicit(
        &self,
        user_id: &UserId,
        scope: OverrideScope,
    ) -> Result<Vec<ExplicitAssignment>> {
        let conn = self.conn.lock().await;
        Self::query_explicit(&conn, user_id, scope).await
    }

    #[instrument(skip(self, assignment), fields(id = %assignment.id), level = "debug")]
    async fn save_explicit(&self, assignment: &ExplicitAssignment) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO explicit_assignments ({EXPLICIT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, experiment_id = excluded.experiment_id,
                 condition_id = excluded.condition_id, scope = excluded.scope, version = excluded.version,
                 updated_at = excluded.updated_at"
            ),
            libsql::params![
                assignment.id.0.to_string(),
                assignment.user_id.as_str(),
                assignment.experiment_id.0.to_string(),
                assignment.condition_id.0.to_string(),
                assignment.scope.as_str(),
                assignment.version as i64,
                format_datetime(assignment.created_at),
                format_datetime(assignment.updated_at)
            ],
        )
        .await
        .map_err(unique_violation)?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_explicit(&self, id: AssignmentId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM explicit_assignments WHERE id = ?",
                [id.0.to_string()],
            )
            .await?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_preview(&self, user_id: &UserId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT 1 FROM preview_users WHERE id = ?", [user_id.as_str()])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    #[instrument(skip(self, user), fields(id = %user.id), level = "debug")]
    async fn put_preview_user(&self, user: &PreviewUser) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO preview_users (id, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            libsql::params![
                user.id.as_str(),
                format_datetime(user.created_at),
                format_datetime(user.updated_at)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_preview_user(&self, user_id: &UserId) -> Result<Option<PreviewUser>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, created_at, updated_at FROM preview_users WHERE id = ?",
                [user_id.as_str()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let mut user = Self::parse_preview_user(&row)?;
        user.assignments = Self::load_preview_assignments(&conn, user_id).await?;
        Ok(Some(user))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_preview_users(
        &self,
        skip: usize,
        take: Option<usize>,
    ) -> Result<Vec<PreviewUser>> {
        let conn = self.conn.lock().await;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = take.map_or(-1, |t| t as i64);
        let mut rows = conn
            .query(
                "SELECT id, created_at, updated_at FROM preview_users ORDER BY created_at, id LIMIT ? OFFSET ?",
                libsql::params![limit, skip as i64],
            )
            .await?;
        let mut users = Vec::new();
        while let Some(row) = rows.next().await? {
            users.push(Self::parse_preview_user(&row)?);
        }
        for user in &mut users {
            user.assignments = Self::load_preview_assignments(&conn, &user.id).await?;
        }
        Ok(users)
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_preview_users(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query("SELECT COUNT(*) FROM preview_users", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_preview_user(&self, user_id: &UserId) -> Result<Option<PreviewUser>> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result: Result<Option<PreviewUser>> = async {
            let mut rows = conn
                .query(
                    "SELECT id, created_at, updated_at FROM preview_users WHERE id = ?",
                    [user_id.as_str()],
                )
                .await?;
            let Some(row) = rows.next().await? else {
                return Ok(None);
            };
            let mut user = Self::parse_preview_user(&row)?;
            user.assignments = Self::load_preview_assignments(&conn, user_id).await?;

            conn.execute(
                "DELETE FROM explicit_assignments WHERE user_id = ? AND scope = ?",
                libsql::params![user_id.as_str(), OverrideScope::Preview.as_str()],
            )
            .await?;
            conn.execute("DELETE FROM preview_users WHERE id = ?", [user_id.as_str()])
                .await?;
            Ok(Some(user))
        }
        .await;
        finish(&conn, result).await
    }
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid> {
    s.parse()
        .map_err(|_| Error::InvalidData(format!("invalid {}: {}", what, s)))
}

/// Map a unique-constraint failure to [`Error::UniqueViolation`].
fn unique_violation(e: libsql::Error) -> Error {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        Error::UniqueViolation(message)
    } else {
        Error::Database(e)
    }
}

/// Format a datetime for storage. Fixed width so text order is time order.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a datetime from storage.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::InvalidData(format!("invalid datetime: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> TursoStore {
        TursoStore::new_memory().await.unwrap()
    }

    fn sample_row(id: ExperimentId) -> ExperimentRow {
        let now = Utc::now();
        ExperimentRow {
            id,
            name: "checkout".to_string(),
            description: "button colour".to_string(),
            context: vec!["web".to_string(), "app".to_string()],
            state: ExperimentState::Enrolling,
            post_experiment_rule: PostExperimentRule::Continue,
            revert_to: None,
            assignment_unit: AssignmentUnit::Group,
            consistency_rule: ConsistencyRule::Group,
            group_type: Some("class".to_string()),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_condition(experiment_id: ExperimentId, code: &str, two_char: &str) -> Condition {
        let now = Utc::now();
        Condition {
            id: ConditionId::new(),
            experiment_id,
            code: code.to_string(),
            description: String::new(),
            assignment_weight: 50,
            two_character_id: two_char.to_string(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_partition(experiment_id: ExperimentId, point: &str, two_char: &str) -> Partition {
        let now = Utc::now();
        Partition {
            id: PartitionId::compose(Some("exp"), point),
            experiment_id,
            exp_point: point.to_string(),
            exp_id: Some("exp".to_string()),
            two_character_id: two_char.to_string(),
            description: String::new(),
            order: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed(store: &TursoStore) -> (ExperimentId, Condition, Partition) {
        let id = ExperimentId::new();
        let condition = sample_condition(id, "A", "C1");
        let partition = sample_partition(id, "W1", "P1");
        store
            .commit(Transaction {
                experiment_id: id,
                expected_version: None,
                ops: vec![
                    WriteOp::PutExperiment(sample_row(id)),
                    WriteOp::UpsertCondition(condition.clone()),
                    WriteOp::UpsertPartition(partition.clone()),
                ],
            })
            .await
            .unwrap();
        (id, condition, partition)
    }

    #[tokio::test]
    async fn store_returns_none_for_nonexistent_experiment() {
        let store = create_test_store().await;

        let result = store.get_experiment(ExperimentId::new()).await.unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn committed_experiment_round_trips() {
        let store = create_test_store().await;
        let (id, condition, partition) = seed(&store).await;

        let experiment = store.get_experiment(id).await.unwrap().unwrap();
        assert_eq!(experiment.row(), sample_row_with_times(&experiment));
        assert_eq!(experiment.context, vec!["web", "app"]);
        assert_eq!(experiment.group_type.as_deref(), Some("class"));
        assert_eq!(experiment.conditions, vec![condition]);
        assert_eq!(experiment.partitions, vec![partition]);
    }

    fn sample_row_with_times(experiment: &Experiment) -> ExperimentRow {
        ExperimentRow {
            created_at: experiment.created_at,
            updated_at: experiment.updated_at,
            ..sample_row(experiment.id)
        }
    }

    #[tokio::test]
    async fn version_mismatch_rolls_back() {
        let store = create_test_store().await;
        let (id, condition, _) = seed(&store).await;

        let err = store
            .commit(Transaction {
                experiment_id: id,
                expected_version: Some(7),
                ops: vec![WriteOp::DeleteCondition(condition.id)],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::VersionConflict { expected: 7, actual: 1 }));
        let experiment = store.get_experiment(id).await.unwrap().unwrap();
        assert_eq!(experiment.conditions.len(), 1);
    }

    #[tokio::test]
    async fn partition_two_char_id_is_globally_unique() {
        let store = create_test_store().await;
        let (owner, _, _) = seed(&store).await;

        let other = ExperimentId::new();
        let err = store
            .commit(Transaction {
                experiment_id: other,
                expected_version: None,
                ops: vec![
                    WriteOp::PutExperiment(sample_row(other)),
                    WriteOp::UpsertPartition(sample_partition(other, "W2", "P1")),
                ],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateTwoCharId { experiment_id, .. } if experiment_id == owner));
        assert!(store.get_experiment(other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_if_absent_returns_existing_record() {
        let store = create_test_store().await;
        let (id, condition, _) = seed(&store).await;

        let record = AssignmentRecord {
            selection_key: "user:u1".to_string(),
            experiment_id: id,
            partition_id: None,
            condition_id: condition.id,
            created_at: Utc::now(),
        };
        let first = store.insert_if_absent(record.clone()).await.unwrap();
        assert_eq!(first, InsertOutcome::Inserted(record.clone()));

        let later = AssignmentRecord {
            created_at: Utc::now(),
            ..record.clone()
        };
        let second = store.insert_if_absent(later).await.unwrap();
        assert_eq!(second, InsertOutcome::Existing(record));
    }

    #[tokio::test]
    async fn deleting_condition_purges_its_records() {
        let store = create_test_store().await;
        let (id, condition, _) = seed(&store).await;
        store
            .insert_if_absent(AssignmentRecord {
                selection_key: "user:u1".to_string(),
                experiment_id: id,
                partition_id: None,
                condition_id: condition.id,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .commit(Transaction {
                experiment_id: id,
                expected_version: Some(1),
                ops: vec![
                    WriteOp::PurgeAssignmentsForCondition(condition.id),
                    WriteOp::DeleteCondition(condition.id),
                ],
            })
            .await
            .unwrap();

        assert!(store.list_assignments(id).await.unwrap().is_empty());
        let stale = store
            .insert_if_absent(AssignmentRecord {
                selection_key: "user:u2".to_string(),
                experiment_id: id,
                partition_id: None,
                condition_id: condition.id,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(stale, InsertOutcome::Stale);
    }

    #[tokio::test]
    async fn visits_are_refreshed_per_user_and_partition() {
        let store = create_test_store().await;
        let (id, condition, partition) = seed(&store).await;

        let visit = DecisionPointVisit {
            user_id: "u1".into(),
            experiment_id: id,
            partition_id: partition.id.clone(),
            condition_id: None,
            visited_at: Utc::now(),
        };
        store.record_visit(&visit).await.unwrap();
        store
            .record_visit(&DecisionPointVisit {
                condition_id: Some(condition.id),
                ..visit.clone()
            })
            .await
            .unwrap();

        let visits = store.list_visits(id).await.unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].condition_id, Some(condition.id));
    }

    #[tokio::test]
    async fn preview_users_page_in_creation_order() {
        let store = create_test_store().await;
        let base = Utc::now();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            let at = base + chrono::Duration::seconds(i as i64);
            store
                .put_preview_user(&PreviewUser {
                    id: name.into(),
                    created_at: at,
                    updated_at: at,
                    assignments: Vec::new(),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.count_preview_users().await.unwrap(), 3);
        let page = store.list_preview_users(1, Some(1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id.as_str(), "b");
        let rest = store.list_preview_users(1, None).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn explicit_assignment_clash_is_unique_violation() {
        let store = create_test_store().await;
        let now = Utc::now();
        let first = ExplicitAssignment {
            id: AssignmentId::new(),
            user_id: "u1".into(),
            experiment_id: ExperimentId::new(),
            condition_id: ConditionId::new(),
            scope: OverrideScope::Individual,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        store.save_explicit(&first).await.unwrap();

        let err = store
            .save_explicit(&ExplicitAssignment {
                id: AssignmentId::new(),
                ..first.clone()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation(_)));

        let found = store
            .get_explicit(&first.user_id, first.experiment_id, OverrideScope::Individual)
            .await
            .unwrap();
        assert_eq!(found, Some(first));
    }
}
