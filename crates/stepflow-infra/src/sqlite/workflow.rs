//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepflow-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs, one row per
//! version. Step commits update the run, append step records, create the
//! approval and enqueue the follow-up work item in one writer transaction.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use stepflow_core::repository::workflow::{RunTransition, StepCommit, WorkflowRepository};
use stepflow_types::approval::Approval;
use stepflow_types::error::RepositoryError;
use stepflow_types::run::{RunFilter, RunStatus, StepRecord, WorkItem, WorkflowRun};
use stepflow_types::workflow::{WorkflowDefinition, WorkflowSummary};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::queue::insert_work_item;
use super::{
    enum_from_column, enum_to_column, format_datetime, parse_datetime, parse_json, parse_uuid,
    query_error, to_json,
};

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    version: i64,
    definition: String,
    created_at: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            version: row.try_get("version")?,
            definition: row.try_get("definition")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = parse_json(&self.definition, "workflow definition")?;
        def.version = self.version;
        Ok(def)
    }

    fn into_summary(self) -> Result<WorkflowSummary, RepositoryError> {
        let created_at = parse_datetime(&self.created_at)?;
        let def = self.into_definition()?;
        Ok(WorkflowSummary {
            states: def.states.len(),
            id: def.id,
            version: def.version,
            name: def.name,
            created_at,
        })
    }
}

struct RunRow {
    id: String,
    workflow_id: String,
    workflow_version: i64,
    status: String,
    current_state_id: Option<String>,
    step_seq: i64,
    input: String,
    context: String,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            current_state_id: row.try_get("current_state_id")?,
            step_seq: row.try_get("step_seq")?,
            input: row.try_get("input")?,
            context: row.try_get("context")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            status,
            current_state_id: self.current_state_id,
            step_seq: self.step_seq,
            input: parse_json(&self.input, "run input")?,
            context: parse_json(&self.context, "run context")?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    seq: i64,
    scope: Option<String>,
    state_id: String,
    status: String,
    attempt: i64,
    started_at: String,
    duration_ms: i64,
    output: Option<String>,
    error: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            seq: row.try_get("seq")?,
            scope: row.try_get("scope")?,
            state_id: row.try_get("state_id")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            started_at: row.try_get("started_at")?,
            duration_ms: row.try_get("duration_ms")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
        })
    }

    fn into_record(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            seq: self.seq,
            scope: self.scope,
            state_id: self.state_id,
            status: enum_from_column(&self.status, "step status")?,
            attempt: self.attempt.max(1) as u32,
            started_at: parse_datetime(&self.started_at)?,
            duration_ms: self.duration_ms.max(0) as u64,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "step output"))
                .transpose()?,
            error: self.error,
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers (shared with the approval repository)
// ---------------------------------------------------------------------------

pub(super) async fn insert_step_record(
    conn: &mut SqliteConnection,
    record: &StepRecord,
) -> Result<(), RepositoryError> {
    let output = record.output.as_ref().map(to_json).transpose()?;

    sqlx::query(
        r#"INSERT INTO step_records
           (id, run_id, seq, scope, state_id, status, attempt, started_at, duration_ms, output, error)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(record.id.to_string())
    .bind(record.run_id.to_string())
    .bind(record.seq)
    .bind(&record.scope)
    .bind(&record.state_id)
    .bind(enum_to_column(&record.status)?)
    .bind(i64::from(record.attempt))
    .bind(format_datetime(&record.started_at))
    .bind(record.duration_ms as i64)
    .bind(&output)
    .bind(&record.error)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    Ok(())
}

/// Insert an approval unless one with the same id already exists.
async fn insert_approval(conn: &mut SqliteConnection, approval: &Approval) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO approvals
           (id, run_id, state_id, message, summary_path, approvers, status,
            timeout_at, decided_by, decided_at, comment, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO NOTHING"#,
    )
    .bind(&approval.id)
    .bind(approval.run_id.to_string())
    .bind(&approval.state_id)
    .bind(&approval.message)
    .bind(&approval.summary_path)
    .bind(to_json(&approval.approvers)?)
    .bind(approval.status.as_str())
    .bind(format_datetime(&approval.timeout_at))
    .bind(&approval.decided_by)
    .bind(approval.decided_at.as_ref().map(format_datetime))
    .bind(&approval.comment)
    .bind(format_datetime(&approval.created_at))
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    Ok(())
}

async fn fetch_run(conn: &mut SqliteConnection, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
        .bind(run_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;

    match row {
        Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_error)?.into_run()?)),
        None => Ok(None),
    }
}

fn terminal_at(status: RunStatus, now: &DateTime<Utc>) -> Option<String> {
    status.is_terminal().then(|| format_datetime(now))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<i64, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let latest: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM workflow_definitions WHERE id = ?",
        )
        .bind(&def.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;

        let version = latest + 1;
        let mut stored = def.clone();
        stored.version = version;

        sqlx::query(
            "INSERT INTO workflow_definitions (id, version, name, definition, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(version)
        .bind(&stored.name)
        .bind(to_json(&stored)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(version)
    }

    async fn get_definition(
        &self,
        id: &str,
        version: Option<i64>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = match version {
            Some(v) => {
                sqlx::query("SELECT * FROM workflow_definitions WHERE id = ? AND version = ?")
                    .bind(id)
                    .bind(v)
                    .fetch_optional(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(id)
                .fetch_optional(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(
                DefinitionRow::from_row(&row).map_err(query_error)?.into_definition()?,
            )),
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.* FROM workflow_definitions d
               WHERE d.version = (SELECT MAX(version) FROM workflow_definitions WHERE id = d.id)
               ORDER BY d.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(DefinitionRow::from_row(row).map_err(query_error)?.into_summary()?);
        }
        Ok(out)
    }

    async fn create_run(&self, run: &WorkflowRun, first: &WorkItem) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, workflow_version, status, current_state_id, step_seq,
                input, context, error, created_at, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_id)
        .bind(run.workflow_version)
        .bind(run.status.as_str())
        .bind(&run.current_state_id)
        .bind(run.step_seq)
        .bind(to_json(&run.input)?)
        .bind(to_json(&run.context)?)
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!("run {} already exists", run.id));
                }
            }
            query_error(e)
        })?;

        insert_work_item(&mut tx, first, &Utc::now()).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_error)?.into_run()?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let status = filter.status.map(RunStatus::as_str);

        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs
               WHERE (? IS NULL OR workflow_id = ?)
                 AND (? IS NULL OR status = ?)
               ORDER BY created_at DESC, id DESC
               LIMIT ? OFFSET ?"#,
        )
        .bind(&filter.workflow_id)
        .bind(&filter.workflow_id)
        .bind(status)
        .bind(status)
        .bind(i64::from(filter.effective_limit()))
        .bind(i64::from(filter.offset.unwrap_or(0)))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunRow::from_row(row).map_err(query_error)?.into_run()?);
        }
        Ok(runs)
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = ?,
                 current_state_id = ?,
                 context = ?,
                 error = ?,
                 step_seq = step_seq + 1,
                 updated_at = ?,
                 started_at = COALESCE(started_at, ?),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ? AND step_seq = ? AND status IN ('pending', 'running')"#,
        )
        .bind(commit.status.as_str())
        .bind(&commit.current_state_id)
        .bind(to_json(&commit.context)?)
        .bind(&commit.error)
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(terminal_at(commit.status, &now))
        .bind(commit.run_id.to_string())
        .bind(commit.expected_seq)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            return match fetch_run(&mut tx, &commit.run_id).await? {
                None => Err(RepositoryError::NotFound),
                Some(run) => Err(RepositoryError::Conflict(format!(
                    "run {} is at seq {} ({}), expected seq {}",
                    run.id, run.step_seq, run.status, commit.expected_seq
                ))),
            };
        }

        for record in &commit.records {
            insert_step_record(&mut tx, record).await?;
        }
        if let Some(approval) = &commit.approval {
            insert_approval(&mut tx, approval).await?;
        }
        if let Some(next) = &commit.next {
            insert_work_item(&mut tx, next, &now).await?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn transition_run(&self, transition: &RunTransition) -> Result<WorkflowRun, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut run = fetch_run(&mut tx, &transition.run_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if !transition.from.contains(&run.status) {
            return Err(RepositoryError::Conflict(format!(
                "run {} is {}, cannot become {}",
                run.id, run.status, transition.to
            )));
        }

        let started_at = (transition.to == RunStatus::Running).then(|| format_datetime(&now));
        sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = ?,
                 error = COALESCE(?, error),
                 updated_at = ?,
                 started_at = COALESCE(started_at, ?),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(transition.to.as_str())
        .bind(&transition.error)
        .bind(format_datetime(&now))
        .bind(started_at)
        .bind(terminal_at(transition.to, &now))
        .bind(transition.run_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if let Some(item) = &transition.enqueue {
            insert_work_item(&mut tx, item, &now).await?;
        }

        tx.commit().await.map_err(query_error)?;

        run.status = transition.to;
        run.updated_at = now;
        if transition.error.is_some() {
            run.error = transition.error.clone();
        }
        if transition.to == RunStatus::Running {
            run.started_at.get_or_insert(now);
        }
        if transition.to.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(run)
    }

    async fn list_orphaned_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs r
               WHERE r.status IN ('pending', 'running')
                 AND NOT EXISTS (SELECT 1 FROM work_items w WHERE w.run_id = r.id)
               ORDER BY r.created_at ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(RunRow::from_row(row).map_err(query_error)?.into_run()?);
        }
        Ok(runs)
    }

    async fn fail_run(&self, run_id: &Uuid, error: &str, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"UPDATE workflow_runs SET status = 'failed', error = ?, updated_at = ?, completed_at = ?
               WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(error)
        .bind(format_datetime(&at))
        .bind(format_datetime(&at))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_step_records(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_records WHERE run_id = ? ORDER BY seq ASC, rowid ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(StepRow::from_row(row).map_err(query_error)?.into_record()?);
        }
        Ok(records)
    }
}
