//! SQLite-backed durable work queue.
//!
//! Items live in `work_items` until acknowledged. Dequeue leases the oldest
//! visible row with a single `UPDATE ... RETURNING` on the writer connection,
//! so two consumers never lease the same item.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use stepflow_core::repository::queue::WorkQueue;
use stepflow_types::error::RepositoryError;
use stepflow_types::run::WorkItem;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid, query_error};

#[derive(Clone)]
pub struct SqliteWorkQueue {
    pool: DatabasePool,
}

impl SqliteWorkQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

/// Insert a work item visible from `available_at`. Used inside repository
/// transactions so the item lands together with the state change.
pub(super) async fn insert_work_item(
    conn: &mut SqliteConnection,
    item: &WorkItem,
    available_at: &DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO work_items (id, run_id, state_id, seq, available_at, lease_until, deliveries, created_at)
           VALUES (?, ?, ?, ?, ?, NULL, ?, ?)"#,
    )
    .bind(item.id.to_string())
    .bind(item.run_id.to_string())
    .bind(&item.state_id)
    .bind(item.seq)
    .bind(format_datetime(available_at))
    .bind(i64::from(item.deliveries))
    .bind(format_datetime(&Utc::now()))
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    Ok(())
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, item: &WorkItem) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        insert_work_item(&mut conn, item, &Utc::now()).await
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<WorkItem>, RepositoryError> {
        let now = Utc::now();
        let now_str = format_datetime(&now);

        let row = sqlx::query(
            r#"UPDATE work_items
               SET lease_until = ?, deliveries = deliveries + 1
               WHERE id = (
                   SELECT id FROM work_items
                   WHERE available_at <= ? AND (lease_until IS NULL OR lease_until <= ?)
                   ORDER BY created_at ASC, id ASC
                   LIMIT 1
               )
               RETURNING id, run_id, state_id, seq, deliveries"#,
        )
        .bind(format_datetime(&(now + chrono_duration(lease))))
        .bind(&now_str)
        .bind(&now_str)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(query_error)?;
        let run_id: String = row.try_get("run_id").map_err(query_error)?;
        let deliveries: i64 = row.try_get("deliveries").map_err(query_error)?;

        Ok(Some(WorkItem {
            id: parse_uuid(&id)?,
            run_id: parse_uuid(&run_id)?,
            state_id: row.try_get("state_id").map_err(query_error)?,
            seq: row.try_get("seq").map_err(query_error)?,
            deliveries: deliveries.max(0) as u32,
        }))
    }

    async fn extend_lease(&self, item_id: &Uuid, lease: Duration) -> Result<(), RepositoryError> {
        let lease_until = Utc::now() + chrono_duration(lease);
        sqlx::query("UPDATE work_items SET lease_until = ? WHERE id = ? AND lease_until IS NOT NULL")
            .bind(format_datetime(&lease_until))
            .bind(item_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn ack(&self, item_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM work_items WHERE id = ?")
            .bind(item_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn nack(&self, item_id: &Uuid, delay: Duration) -> Result<(), RepositoryError> {
        let available_at = Utc::now() + chrono_duration(delay);
        sqlx::query("UPDATE work_items SET lease_until = NULL, available_at = ? WHERE id = ?")
            .bind(format_datetime(&available_at))
            .bind(item_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_items")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(count.max(0) as u64)
    }
}
