//! SQLite approval repository implementation.
//!
//! Decisions are written in one writer transaction: the approval update is
//! guarded by `status = 'pending'` and the optional run resume by
//! `status = 'waiting_approval' AND step_seq = ?`.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use stepflow_core::repository::approval::{ApprovalRepository, ApprovalResolution, RunResume};
use stepflow_types::approval::{Approval, ApprovalFilter, ApprovalStatus, DeliveryRecord};
use stepflow_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::queue::insert_work_item;
use super::workflow::insert_step_record;
use super::{
    enum_from_column, enum_to_column, format_datetime, parse_datetime, parse_json, parse_uuid,
    query_error, to_json,
};

/// SQLite-backed implementation of `ApprovalRepository`.
#[derive(Clone)]
pub struct SqliteApprovalRepository {
    pool: DatabasePool,
}

impl SqliteApprovalRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ApprovalRow {
    id: String,
    run_id: String,
    state_id: String,
    message: String,
    summary_path: Option<String>,
    approvers: String,
    status: String,
    timeout_at: String,
    decided_by: Option<String>,
    decided_at: Option<String>,
    comment: Option<String>,
    created_at: String,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            state_id: row.try_get("state_id")?,
            message: row.try_get("message")?,
            summary_path: row.try_get("summary_path")?,
            approvers: row.try_get("approvers")?,
            status: row.try_get("status")?,
            timeout_at: row.try_get("timeout_at")?,
            decided_by: row.try_get("decided_by")?,
            decided_at: row.try_get("decided_at")?,
            comment: row.try_get("comment")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_approval(self) -> Result<Approval, RepositoryError> {
        let status: ApprovalStatus = self.status.parse().map_err(RepositoryError::Query)?;

        Ok(Approval {
            id: self.id,
            run_id: parse_uuid(&self.run_id)?,
            state_id: self.state_id,
            message: self.message,
            summary_path: self.summary_path,
            approvers: parse_json(&self.approvers, "approvers")?,
            status,
            timeout_at: parse_datetime(&self.timeout_at)?,
            decided_by: self.decided_by,
            decided_at: self.decided_at.as_deref().map(parse_datetime).transpose()?,
            comment: self.comment,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct DeliveryRow {
    id: String,
    approval_id: String,
    attempt: i64,
    status: String,
    status_code: Option<i64>,
    response_body: Option<String>,
    error: Option<String>,
    duration_ms: i64,
    attempted_at: String,
}

impl DeliveryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            approval_id: row.try_get("approval_id")?,
            attempt: row.try_get("attempt")?,
            status: row.try_get("status")?,
            status_code: row.try_get("status_code")?,
            response_body: row.try_get("response_body")?,
            error: row.try_get("error")?,
            duration_ms: row.try_get("duration_ms")?,
            attempted_at: row.try_get("attempted_at")?,
        })
    }

    fn into_record(self) -> Result<DeliveryRecord, RepositoryError> {
        Ok(DeliveryRecord {
            id: parse_uuid(&self.id)?,
            approval_id: self.approval_id,
            attempt: self.attempt.max(0) as u32,
            status: enum_from_column(&self.status, "delivery status")?,
            status_code: self.status_code.and_then(|c| u16::try_from(c).ok()),
            response_body: self.response_body,
            error: self.error,
            duration_ms: self.duration_ms.max(0) as u64,
            attempted_at: parse_datetime(&self.attempted_at)?,
        })
    }
}

fn rows_into_approvals(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Approval>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ApprovalRow::from_row(row).map_err(query_error)?.into_approval()?);
    }
    Ok(out)
}

/// Apply the run half of a decision. Returns false when the run has moved on.
async fn resume_run(
    conn: &mut SqliteConnection,
    resume: &RunResume,
    now: &DateTime<Utc>,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        r#"UPDATE workflow_runs SET
             status = ?,
             current_state_id = ?,
             context = ?,
             step_seq = step_seq + 1,
             updated_at = ?,
             completed_at = COALESCE(?, completed_at)
           WHERE id = ? AND status = 'waiting_approval' AND step_seq = ?"#,
    )
    .bind(resume.status.as_str())
    .bind(&resume.current_state_id)
    .bind(to_json(&resume.context)?)
    .bind(format_datetime(now))
    .bind(resume.status.is_terminal().then(|| format_datetime(now)))
    .bind(resume.run_id.to_string())
    .bind(resume.expected_seq)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    insert_step_record(&mut *conn, &resume.record).await?;
    if let Some(next) = &resume.next {
        insert_work_item(&mut *conn, next, now).await?;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// ApprovalRepository impl
// ---------------------------------------------------------------------------

impl ApprovalRepository for SqliteApprovalRepository {
    async fn get_approval(&self, id: &str) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM approvals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(ApprovalRow::from_row(&row).map_err(query_error)?.into_approval()?)),
            None => Ok(None),
        }
    }

    async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, RepositoryError> {
        let status = filter.status.map(ApprovalStatus::as_str);
        let run_id = filter.run_id.map(|id| id.to_string());
        // SQLite treats a negative LIMIT as no limit.
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            r#"SELECT * FROM approvals
               WHERE (? IS NULL OR status = ?)
                 AND (? IS NULL OR run_id = ?)
               ORDER BY created_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(status)
        .bind(status)
        .bind(&run_id)
        .bind(&run_id)
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_into_approvals(&rows)
    }

    async fn decide_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> Result<(Approval, bool), RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let row = sqlx::query("SELECT * FROM approvals WHERE id = ?")
            .bind(&resolution.approval_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?
            .ok_or(RepositoryError::NotFound)?;
        let mut approval = ApprovalRow::from_row(&row).map_err(query_error)?.into_approval()?;

        if approval.status != ApprovalStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "approval {} is already {}",
                approval.id,
                approval.status.as_str()
            )));
        }

        sqlx::query(
            r#"UPDATE approvals SET status = ?, decided_by = ?, decided_at = ?, comment = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(resolution.status.as_str())
        .bind(&resolution.decided_by)
        .bind(format_datetime(&resolution.decided_at))
        .bind(&resolution.comment)
        .bind(&resolution.approval_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let resumed = match &resolution.resume {
            Some(resume) => resume_run(&mut tx, resume, &now).await?,
            None => false,
        };

        tx.commit().await.map_err(query_error)?;

        approval.status = resolution.status;
        approval.decided_by = Some(resolution.decided_by.clone());
        approval.decided_at = Some(resolution.decided_at);
        approval.comment = resolution.comment.clone();
        Ok((approval, resumed))
    }

    async fn list_expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM approvals WHERE status = 'pending' AND timeout_at <= ? ORDER BY timeout_at ASC",
        )
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_into_approvals(&rows)
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO webhook_deliveries
               (id, approval_id, attempt, status, status_code, response_body, error, duration_ms, attempted_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(&record.approval_id)
        .bind(i64::from(record.attempt))
        .bind(enum_to_column(&record.status)?)
        .bind(record.status_code.map(i64::from))
        .bind(&record.response_body)
        .bind(&record.error)
        .bind(record.duration_ms as i64)
        .bind(format_datetime(&record.attempted_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_deliveries(&self, approval_id: &str) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_deliveries WHERE approval_id = ? ORDER BY attempted_at ASC, attempt ASC",
        )
        .bind(approval_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(DeliveryRow::from_row(row).map_err(query_error)?.into_record()?);
        }
        Ok(out)
    }
}
