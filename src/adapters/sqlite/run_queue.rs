//! SQLite implementation of the `RunQueue` port.
//!
//! `claim` follows the teacher's atomic-claim pattern: a single `UPDATE`
//! guarded by the precondition, won by whichever caller's write lands
//! first; `rows_affected() == 0` means someone else already claimed it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::SchedulerResult;
use crate::domain::models::{encode_queue_number, TaskToRun};
use crate::domain::ports::RunQueue;

use super::parse_datetime;

#[derive(Clone)]
pub struct SqliteRunQueue {
    pool: SqlitePool,
}

impl SqliteRunQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunQueue for SqliteRunQueue {
    async fn put(&self, row: TaskToRun) -> SchedulerResult<()> {
        let dimensions_json = serde_json::to_string(&row.dimensions)?;
        sqlx::query(
            r#"INSERT INTO task_to_run (request_id, dimensions, queue_number, expiration_ts)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(row.request_id as i64)
        .bind(&dimensions_json)
        .bind(row.queue_number.map(|n| n as i64))
        .bind(row.expiration_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn yield_next_available(
        &self,
        bot_dimensions: &BTreeMap<String, Vec<String>>,
        limit: u32,
    ) -> SchedulerResult<Vec<TaskToRun>> {
        let rows: Vec<TaskToRunRow> = sqlx::query_as(
            r#"SELECT request_id, dimensions, queue_number, expiration_ts
               FROM task_to_run
               WHERE queue_number IS NOT NULL
               ORDER BY queue_number ASC
               LIMIT ?"#,
        )
        .bind((limit as i64).max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(TaskToRun::try_from)
            .collect::<SchedulerResult<Vec<_>>>()
            .map(|candidates| {
                candidates
                    .into_iter()
                    .filter(|row| row.matches(bot_dimensions))
                    .collect()
            })
    }

    async fn claim(&self, request_id: u64) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"UPDATE task_to_run SET queue_number = NULL
               WHERE request_id = ? AND queue_number IS NOT NULL"#,
        )
        .bind(request_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn rearm(&self, request_id: u64, priority: u8, created_ts: DateTime<Utc>) -> SchedulerResult<()> {
        let queue_number = encode_queue_number(priority, created_ts) as i64;
        sqlx::query("UPDATE task_to_run SET queue_number = ? WHERE request_id = ?")
            .bind(queue_number)
            .bind(request_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<u64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"UPDATE task_to_run SET queue_number = NULL
               WHERE queue_number IS NOT NULL AND expiration_ts <= ?
               RETURNING request_id"#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id as u64).collect())
    }
}

#[derive(sqlx::FromRow)]
struct TaskToRunRow {
    request_id: i64,
    dimensions: String,
    queue_number: Option<i64>,
    expiration_ts: String,
}

impl TryFrom<TaskToRunRow> for TaskToRun {
    type Error = crate::domain::errors::SchedulerError;

    fn try_from(row: TaskToRunRow) -> Result<Self, Self::Error> {
        Ok(TaskToRun {
            request_id: row.request_id as u64,
            dimensions: serde_json::from_str(&row.dimensions)?,
            queue_number: row.queue_number.map(|n| n as u64),
            expiration_ts: parse_datetime(&row.expiration_ts)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn queue() -> SqliteRunQueue {
        let pool = crate::adapters::sqlite::create_migrated_test_pool()
            .await
            .unwrap();
        sqlx::query("INSERT INTO task_requests (id, created_ts, name, user, priority, expiration_ts, tags, properties) VALUES (1, '2024-01-01T00:00:00Z', 'n', 'u', 50, '2024-01-02T00:00:00Z', '[]', '{}')")
            .execute(&pool)
            .await
            .unwrap();
        SqliteRunQueue::new(pool)
    }

    #[tokio::test]
    async fn put_then_yield_returns_matching_pending_row() {
        let queue = queue().await;
        let now = Utc::now();
        let row = TaskToRun::new(1, 50, dims(&[("os", "linux")]), now, now + chrono::Duration::hours(1));
        queue.put(row).await.unwrap();

        let bot = BTreeMap::from([("os".to_string(), vec!["linux".to_string()])]);
        let candidates = queue.yield_next_available(&bot, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].request_id, 1);
    }

    #[tokio::test]
    async fn yield_filters_out_non_matching_dimensions() {
        let queue = queue().await;
        let now = Utc::now();
        let row = TaskToRun::new(1, 50, dims(&[("os", "linux")]), now, now + chrono::Duration::hours(1));
        queue.put(row).await.unwrap();

        let bot = BTreeMap::from([("os".to_string(), vec!["mac".to_string()])]);
        let candidates = queue.yield_next_available(&bot, 10).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn claim_is_won_exactly_once() {
        let queue = queue().await;
        let now = Utc::now();
        let row = TaskToRun::new(1, 50, dims(&[]), now, now + chrono::Duration::hours(1));
        queue.put(row).await.unwrap();

        assert!(queue.claim(1).await.unwrap());
        assert!(!queue.claim(1).await.unwrap());
    }

    #[tokio::test]
    async fn expire_due_clears_only_past_deadline_rows() {
        let queue = queue().await;
        let now = Utc::now();
        let row = TaskToRun::new(1, 50, dims(&[]), now, now - chrono::Duration::seconds(1));
        queue.put(row).await.unwrap();

        let cleared = queue.expire_due(now).await.unwrap();
        assert_eq!(cleared, vec![1]);
        assert!(!queue.claim(1).await.unwrap());
    }
}
