//! Postgres store implementation.
//!
//! Uses runtime-checked sqlx queries so the crate compiles without a live
//! database. Snapshot reads run against the pool and never block writers
//! (Postgres MVCC); units of work wrap one `Transaction`, inside which
//! the pessimistic approval lock is a `SELECT ... FOR UPDATE` and the
//! optimistic workflow update is a conditional `UPDATE ... WHERE version`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use ulid::Ulid;

use signoff_core::{ApprovalId, DeadLetterId, StepId, WorkflowId};

use super::{CasResult, Store, UnitOfWork};
use crate::approval::{Approval, ApprovalStatus, Decision, UiSchema};
use crate::dlq::DeadLetter;
use crate::error::{Error, Result};
use crate::events::{EventKind, WorkflowEventRecord};
use crate::step::{Step, StepKind, StepStatus};
use crate::workflow::{Workflow, WorkflowState};

/// Schema bootstrap DDL, applied statement by statement by [`PgStore::migrate`].
const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS workflows (
        id              TEXT PRIMARY KEY,
        workflow_type   TEXT NOT NULL,
        context         JSONB NOT NULL,
        state           TEXT NOT NULL,
        version         BIGINT NOT NULL,
        retry_count     INT NOT NULL,
        max_retries     INT NOT NULL,
        is_multi_step   BOOLEAN NOT NULL,
        idempotency_key TEXT,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        last_retry_at   TIMESTAMPTZ
    )
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_workflows_idempotency
        ON workflows (workflow_type, idempotency_key)
        WHERE idempotency_key IS NOT NULL
    ",
    r"CREATE INDEX IF NOT EXISTS idx_workflows_state_created ON workflows (state, created_at)",
    r"CREATE INDEX IF NOT EXISTS idx_workflows_type ON workflows (workflow_type)",
    r"
    CREATE TABLE IF NOT EXISTS workflow_events (
        id          TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL REFERENCES workflows (id),
        event_type  TEXT NOT NULL,
        payload     JSONB NOT NULL,
        sequence    BIGINT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        UNIQUE (workflow_id, sequence)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_workflow_events_wf_time
        ON workflow_events (workflow_id, occurred_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS workflow_steps (
        id           TEXT PRIMARY KEY,
        workflow_id  TEXT NOT NULL REFERENCES workflows (id),
        step_index   INT NOT NULL,
        kind         TEXT NOT NULL,
        status       TEXT NOT NULL,
        task_handler TEXT,
        task_input   JSONB,
        task_output  JSONB,
        approval_id  TEXT,
        started_at   TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        UNIQUE (workflow_id, step_index)
    )
    ",
    r"CREATE INDEX IF NOT EXISTS idx_workflow_steps_approval ON workflow_steps (approval_id)",
    r"
    CREATE TABLE IF NOT EXISTS approvals (
        id             TEXT PRIMARY KEY,
        workflow_id    TEXT NOT NULL REFERENCES workflows (id),
        step_id        TEXT,
        ui_schema      JSONB NOT NULL,
        status         TEXT NOT NULL,
        requested_at   TIMESTAMPTZ NOT NULL,
        expires_at     TIMESTAMPTZ NOT NULL,
        responded_at   TIMESTAMPTZ,
        decision       TEXT,
        response_data  JSONB,
        callback_token TEXT NOT NULL UNIQUE
    )
    ",
    r"CREATE INDEX IF NOT EXISTS idx_approvals_status_expires ON approvals (status, expires_at)",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id          TEXT PRIMARY KEY,
        event_type  TEXT NOT NULL,
        payload     JSONB NOT NULL,
        error       TEXT NOT NULL,
        retry_count INT NOT NULL,
        workflow_id TEXT,
        created_at  TIMESTAMPTZ NOT NULL
    )
    ",
];

const WORKFLOW_COLUMNS: &str = "id, workflow_type, context, state, version, retry_count, \
     max_retries, is_multi_step, idempotency_key, created_at, updated_at, last_retry_at";

const STEP_COLUMNS: &str = "id, workflow_id, step_index, kind, status, task_handler, \
     task_input, task_output, approval_id, started_at, completed_at";

const APPROVAL_COLUMNS: &str = "id, workflow_id, step_id, ui_schema, status, requested_at, \
     expires_at, responded_at, decision, response_data, callback_token";

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the connection cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| Error::storage_with_source("failed to connect to postgres", e))?;
        Ok(Self { pool })
    }

    /// Creates a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema bootstrap DDL.
    ///
    /// # Errors
    ///
    /// Returns a storage error when a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::storage_with_source("migration failed", e))?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::storage_with_source("query failed", e)
}

fn parse_id<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = signoff_core::Error>,
{
    value.parse::<T>().map_err(Error::from)
}

fn i64_to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::serialization(format!("negative {field}: {value}")))
}

fn i32_to_u32(value: i32, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::serialization(format!("negative {field}: {value}")))
}

fn u64_to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::serialization(format!("{field} out of range: {value}")))
}

fn row_to_workflow(row: &PgRow) -> Result<Workflow> {
    let state: String = row.try_get("state").map_err(db_err)?;
    Ok(Workflow {
        id: parse_id(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        workflow_type: row.try_get("workflow_type").map_err(db_err)?,
        context: row.try_get("context").map_err(db_err)?,
        state: state.parse::<WorkflowState>().map_err(Error::serialization)?,
        version: i64_to_u64(row.try_get("version").map_err(db_err)?, "version")?,
        retry_count: i32_to_u32(row.try_get("retry_count").map_err(db_err)?, "retry_count")?,
        max_retries: i32_to_u32(row.try_get("max_retries").map_err(db_err)?, "max_retries")?,
        is_multi_step: row.try_get("is_multi_step").map_err(db_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        last_retry_at: row.try_get("last_retry_at").map_err(db_err)?,
    })
}

fn row_to_step(row: &PgRow) -> Result<Step> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let approval_id: Option<String> = row.try_get("approval_id").map_err(db_err)?;
    Ok(Step {
        id: parse_id(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        workflow_id: parse_id(&row.try_get::<String, _>("workflow_id").map_err(db_err)?)?,
        step_index: i32_to_u32(row.try_get("step_index").map_err(db_err)?, "step_index")?,
        kind: kind.parse::<StepKind>().map_err(Error::serialization)?,
        status: status.parse::<StepStatus>().map_err(Error::serialization)?,
        task_handler: row.try_get("task_handler").map_err(db_err)?,
        task_input: row.try_get("task_input").map_err(db_err)?,
        task_output: row.try_get("task_output").map_err(db_err)?,
        approval_id: approval_id.as_deref().map(parse_id).transpose()?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}

fn row_to_approval(row: &PgRow) -> Result<Approval> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let step_id: Option<String> = row.try_get("step_id").map_err(db_err)?;
    let decision: Option<String> = row.try_get("decision").map_err(db_err)?;
    let ui_schema: JsonValue = row.try_get("ui_schema").map_err(db_err)?;
    Ok(Approval {
        id: parse_id(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        workflow_id: parse_id(&row.try_get::<String, _>("workflow_id").map_err(db_err)?)?,
        step_id: step_id.as_deref().map(parse_id).transpose()?,
        ui_schema: serde_json::from_value::<UiSchema>(ui_schema)
            .map_err(|e| Error::serialization(format!("stored ui_schema invalid: {e}")))?,
        status: status
            .parse::<ApprovalStatus>()
            .map_err(Error::serialization)?,
        requested_at: row.try_get("requested_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        responded_at: row.try_get("responded_at").map_err(db_err)?,
        decision: decision
            .as_deref()
            .map(Decision::parse)
            .transpose()?,
        response_data: row.try_get("response_data").map_err(db_err)?,
        callback_token: row.try_get("callback_token").map_err(db_err)?,
    })
}

fn row_to_event(row: &PgRow) -> Result<WorkflowEventRecord> {
    let event_type: String = row.try_get("event_type").map_err(db_err)?;
    Ok(WorkflowEventRecord {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: parse_id(&row.try_get::<String, _>("workflow_id").map_err(db_err)?)?,
        event_type: event_type
            .parse::<EventKind>()
            .map_err(Error::serialization)?,
        payload: row.try_get("payload").map_err(db_err)?,
        sequence: i64_to_u64(row.try_get("sequence").map_err(db_err)?, "sequence")?,
        occurred_at: row.try_get("occurred_at").map_err(db_err)?,
    })
}

fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetter> {
    let workflow_id: Option<String> = row.try_get("workflow_id").map_err(db_err)?;
    Ok(DeadLetter {
        id: parse_id(&row.try_get::<String, _>("id").map_err(db_err)?)?,
        event_type: row.try_get("event_type").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        retry_count: i32_to_u32(row.try_get("retry_count").map_err(db_err)?, "retry_count")?,
        workflow_id: workflow_id.as_deref().map(parse_id).transpose()?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::storage_with_source("failed to begin transaction", e))?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn workflow_by_idempotency_key(
        &self,
        workflow_type: &str,
        key: &str,
    ) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows \
             WHERE workflow_type = $1 AND idempotency_key = $2"
        ))
        .bind(workflow_type)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: usize,
    ) -> Result<Vec<Workflow>> {
        let limit = u64_to_i64(limit as u64, "limit")?;
        let rows = if let Some(state) = state {
            sqlx::query(&format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = $1 \
                 ORDER BY created_at DESC LIMIT $2"
            ))
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
        } else {
            sqlx::query(&format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC LIMIT $1"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
        };
        rows.iter().map(row_to_workflow).collect()
    }

    async fn events(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowEventRecord>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, event_type, payload, sequence, occurred_at \
             FROM workflow_events WHERE workflow_id = $1 ORDER BY sequence",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_index"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_step).collect()
    }

    async fn step_by_approval(&self, approval_id: ApprovalId) -> Result<Option<Step>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE approval_id = $1"
        ))
        .bind(approval_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_step).transpose()
    }

    async fn approval(&self, id: ApprovalId) -> Result<Option<Approval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_approval).transpose()
    }

    async fn approval_by_token(&self, token: &str) -> Result<Option<Approval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE callback_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_approval).transpose()
    }

    async fn expired_approvals(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Approval>> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals \
             WHERE status = 'PENDING' AND expires_at <= $1 \
             ORDER BY expires_at LIMIT $2"
        ))
        .bind(now)
        .bind(u64_to_i64(limit as u64, "limit")?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_approval).collect()
    }

    async fn stalled_workflows(&self, limit: usize) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows \
             WHERE state IN ('TIMEOUT', 'FAILED') \
             ORDER BY updated_at LIMIT $1"
        ))
        .bind(u64_to_i64(limit as u64, "limit")?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_workflow).collect()
    }

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters \
             (id, event_type, payload, error, retry_count, workflow_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(&entry.error)
        .bind(i32::try_from(entry.retry_count).unwrap_or(i32::MAX))
        .bind(entry.workflow_id.map(|id| id.to_string()))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn dead_letter_exists(
        &self,
        workflow_id: WorkflowId,
        event_type: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM dead_letters \
             WHERE workflow_id = $1 AND event_type = $2 LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT id, event_type, payload, error, retry_count, workflow_id, created_at \
             FROM dead_letters ORDER BY created_at DESC LIMIT $1",
        )
        .bind(u64_to_i64(limit as u64, "limit")?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_dead_letter).collect()
    }

    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Unit of work over one Postgres transaction.
struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_workflow(&mut self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflows \
             (id, workflow_type, context, state, version, retry_count, max_retries, \
              is_multi_step, idempotency_key, created_at, updated_at, last_retry_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.workflow_type)
        .bind(&workflow.context)
        .bind(workflow.state.as_str())
        .bind(u64_to_i64(workflow.version, "version")?)
        .bind(i32::try_from(workflow.retry_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(workflow.max_retries).unwrap_or(i32::MAX))
        .bind(workflow.is_multi_step)
        .bind(&workflow.idempotency_key)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.last_retry_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn workflow(&mut self, id: WorkflowId) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn workflow_by_idempotency_key(
        &mut self,
        workflow_type: &str,
        key: &str,
    ) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows \
             WHERE workflow_type = $1 AND idempotency_key = $2"
        ))
        .bind(workflow_type)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn update_workflow(
        &mut self,
        workflow: &Workflow,
        expected_version: u64,
    ) -> Result<CasResult> {
        let result = sqlx::query(
            "UPDATE workflows SET \
                 context = $2, state = $3, version = $4, retry_count = $5, \
                 updated_at = $6, last_retry_at = $7 \
             WHERE id = $1 AND version = $8",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.context)
        .bind(workflow.state.as_str())
        .bind(u64_to_i64(workflow.version, "version")?)
        .bind(i32::try_from(workflow.retry_count).unwrap_or(i32::MAX))
        .bind(workflow.updated_at)
        .bind(workflow.last_retry_at)
        .bind(u64_to_i64(expected_version, "expected_version")?)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(CasResult::Committed);
        }

        let exists = sqlx::query("SELECT 1 AS present FROM workflows WHERE id = $1")
            .bind(workflow.id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        if exists.is_some() {
            Ok(CasResult::Conflict)
        } else {
            Err(Error::WorkflowNotFound {
                workflow_id: workflow.id,
            })
        }
    }

    async fn insert_step(&mut self, step: &Step) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_steps \
             (id, workflow_id, step_index, kind, status, task_handler, task_input, \
              task_output, approval_id, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(step.id.to_string())
        .bind(step.workflow_id.to_string())
        .bind(i32::try_from(step.step_index).unwrap_or(i32::MAX))
        .bind(step.kind.as_str())
        .bind(step.status.as_str())
        .bind(&step.task_handler)
        .bind(&step.task_input)
        .bind(&step.task_output)
        .bind(step.approval_id.map(|id| id.to_string()))
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn steps(&mut self, workflow_id: WorkflowId) -> Result<Vec<Step>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_index"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_step).collect()
    }

    async fn step(&mut self, id: StepId) -> Result<Option<Step>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_step).transpose()
    }

    async fn step_by_approval(&mut self, approval_id: ApprovalId) -> Result<Option<Step>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE approval_id = $1"
        ))
        .bind(approval_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_step).transpose()
    }

    async fn update_step(&mut self, step: &Step) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workflow_steps SET \
                 status = $2, task_output = $3, approval_id = $4, \
                 started_at = $5, completed_at = $6 \
             WHERE id = $1",
        )
        .bind(step.id.to_string())
        .bind(step.status.as_str())
        .bind(&step.task_output)
        .bind(step.approval_id.map(|id| id.to_string()))
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::StepNotFound { step_id: step.id });
        }
        Ok(())
    }

    async fn insert_approval(&mut self, approval: &Approval) -> Result<()> {
        let ui_schema = serde_json::to_value(&approval.ui_schema)
            .map_err(|e| Error::serialization(format!("ui_schema: {e}")))?;
        sqlx::query(
            "INSERT INTO approvals \
             (id, workflow_id, step_id, ui_schema, status, requested_at, expires_at, \
              responded_at, decision, response_data, callback_token) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(approval.id.to_string())
        .bind(approval.workflow_id.to_string())
        .bind(approval.step_id.map(|id| id.to_string()))
        .bind(ui_schema)
        .bind(approval.status.as_str())
        .bind(approval.requested_at)
        .bind(approval.expires_at)
        .bind(approval.responded_at)
        .bind(approval.decision.map(|d| d.as_str()))
        .bind(&approval.response_data)
        .bind(&approval.callback_token)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn lock_approval(&mut self, id: ApprovalId) -> Result<Option<Approval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_approval).transpose()
    }

    async fn lock_approval_by_token(&mut self, token: &str) -> Result<Option<Approval>> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE callback_token = $1 FOR UPDATE"
        ))
        .bind(token)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_approval).transpose()
    }

    async fn pending_approvals(&mut self, workflow_id: WorkflowId) -> Result<Vec<Approval>> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals \
             WHERE workflow_id = $1 AND status = 'PENDING' \
             ORDER BY requested_at FOR UPDATE"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_approval).collect()
    }

    async fn update_approval(&mut self, approval: &Approval) -> Result<()> {
        let result = sqlx::query(
            "UPDATE approvals SET \
                 status = $2, responded_at = $3, decision = $4, response_data = $5 \
             WHERE id = $1",
        )
        .bind(approval.id.to_string())
        .bind(approval.status.as_str())
        .bind(approval.responded_at)
        .bind(approval.decision.map(|d| d.as_str()))
        .bind(&approval.response_data)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::ApprovalNotFound {
                approval_id: approval.id,
            });
        }
        Ok(())
    }

    async fn append_event(
        &mut self,
        workflow_id: WorkflowId,
        event_type: EventKind,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Result<WorkflowEventRecord> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next \
             FROM workflow_events WHERE workflow_id = $1",
        )
        .bind(workflow_id.to_string())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        let sequence: i64 = row.try_get("next").map_err(db_err)?;

        let record = WorkflowEventRecord {
            id: Ulid::new().to_string(),
            workflow_id,
            event_type,
            payload,
            sequence: i64_to_u64(sequence, "sequence")?,
            occurred_at,
        };

        sqlx::query(
            "INSERT INTO workflow_events \
             (id, workflow_id, event_type, payload, sequence, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.id)
        .bind(record.workflow_id.to_string())
        .bind(record.event_type.as_str())
        .bind(&record.payload)
        .bind(sequence)
        .bind(record.occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(record)
    }

    async fn insert_dead_letter(&mut self, entry: &DeadLetter) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters \
             (id, event_type, payload, error, retry_count, workflow_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(&entry.error)
        .bind(i32::try_from(entry.retry_count).unwrap_or(i32::MAX))
        .bind(entry.workflow_id.map(|id| id.to_string()))
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| Error::storage_with_source("commit failed", e))
    }
}
