//! SQLite implementation of the `RequestStore` port.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;

use crate::domain::errors::{SchedulerError, SchedulerResult};
use crate::domain::key_codec::{self, RequestKey};
use crate::domain::models::{NewTaskRequest, TaskProperties, TaskRequest};
use crate::domain::ports::RequestStore;

use super::{parse_datetime, parse_json_or_default};

/// Number of times `new_request` will re-roll the random jitter byte after
/// an id collision before giving up with `IdExhausted`.
const MAX_ID_ATTEMPTS: u32 = 8;

#[derive(Clone)]
pub struct SqliteRequestStore {
    pool: SqlitePool,
}

impl SqliteRequestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, request: &TaskRequest) -> SchedulerResult<bool> {
        let tags_json = serde_json::to_string(&request.tags)?;
        let properties_json = request.properties.canonical_json()?;

        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO task_requests
               (id, created_ts, name, user, priority, expiration_ts, parent_task_id,
                tags, properties, properties_hash)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(request.id as i64)
        .bind(request.created_ts.to_rfc3339())
        .bind(&request.name)
        .bind(&request.user)
        .bind(request.priority as i64)
        .bind(request.expiration_ts.to_rfc3339())
        .bind(&request.parent_task_id)
        .bind(&tags_json)
        .bind(&properties_json)
        .bind(&request.properties_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn new_request(&self, data: NewTaskRequest) -> SchedulerResult<TaskRequest> {
        data.validate()?;
        let now = Utc::now();
        let created_ms = now.timestamp_millis().max(0) as u64;

        for _ in 0..MAX_ID_ATTEMPTS {
            let jitter: u8 = rand::thread_rng().gen();
            let id = key_codec::compose_request_id(created_ms, jitter);
            let request = TaskRequest::build(data.clone(), id, now)?;
            if self.insert(&request).await? {
                return Ok(request);
            }
        }
        Err(SchedulerError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    async fn get(&self, request_id: u64) -> SchedulerResult<TaskRequest> {
        let row: Option<TaskRequestRow> =
            sqlx::query_as("SELECT * FROM task_requests WHERE id = ?")
                .bind(request_id as i64)
                .fetch_optional(&self.pool)
                .await?;

        let row = row.ok_or_else(|| {
            SchedulerError::NotFound(
                "TaskRequest",
                key_codec::pack_request_id(RequestKey(request_id)),
            )
        })?;
        row.try_into()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRequestRow {
    id: i64,
    created_ts: String,
    name: String,
    user: String,
    priority: i64,
    expiration_ts: String,
    parent_task_id: Option<String>,
    tags: String,
    properties: String,
    properties_hash: Option<String>,
}

impl TryFrom<TaskRequestRow> for TaskRequest {
    type Error = SchedulerError;

    fn try_from(row: TaskRequestRow) -> Result<Self, Self::Error> {
        let properties: TaskProperties = serde_json::from_str(&row.properties)?;
        Ok(TaskRequest {
            id: row.id as u64,
            created_ts: parse_datetime(&row.created_ts)?,
            name: row.name,
            user: row.user,
            priority: row.priority as u8,
            expiration_ts: parse_datetime(&row.expiration_ts)?,
            parent_task_id: row.parent_task_id,
            tags: parse_json_or_default(Some(row.tags))?,
            properties,
            properties_hash: row.properties_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn store() -> SqliteRequestStore {
        let pool = crate::adapters::sqlite::create_migrated_test_pool()
            .await
            .unwrap();
        SqliteRequestStore::new(pool)
    }

    fn sample() -> NewTaskRequest {
        NewTaskRequest {
            name: "build".into(),
            user: "alice".into(),
            priority: 50,
            properties: TaskProperties {
                commands: vec![vec!["make".into()]],
                data: vec![],
                dimensions: BTreeMap::from([("os".into(), "linux".into())]),
                env: BTreeMap::new(),
                execution_timeout_secs: 60,
                io_timeout_secs: 60,
                idempotent: false,
            },
            scheduling_expiration_secs: 60,
            parent_task_id: None,
            tags: vec!["ci".into()],
        }
    }

    #[tokio::test]
    async fn new_request_round_trips_through_get() {
        let store = store().await;
        let created = store.new_request(sample()).await.unwrap();
        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.name, "build");
        assert_eq!(fetched.tags, vec!["ci".to_string()]);
    }

    #[tokio::test]
    async fn get_missing_request_is_not_found() {
        let store = store().await;
        let err = store.get(0xDEAD).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound("TaskRequest", _)));
    }

    #[tokio::test]
    async fn idempotent_request_persists_its_hash() {
        let store = store().await;
        let mut data = sample();
        data.properties.idempotent = true;
        let created = store.new_request(data).await.unwrap();
        assert!(created.properties_hash.is_some());
        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched.properties_hash, created.properties_hash);
    }
}
