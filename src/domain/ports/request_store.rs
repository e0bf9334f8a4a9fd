//! Port for persisting immutable task requests.

use async_trait::async_trait;

use crate::domain::errors::SchedulerResult;
use crate::domain::models::{NewTaskRequest, TaskRequest};

/// Persists a [`TaskRequest`] under a time-ordered key and computes the
/// dedup fingerprint. Implementations own id allocation: `new_request`
/// must retry on id collision per the specification's `IdExhausted` path.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Validate, allocate an id, compute `properties_hash` if idempotent,
    /// and persist in a single write.
    async fn new_request(&self, data: NewTaskRequest) -> SchedulerResult<TaskRequest>;

    async fn get(&self, request_id: u64) -> SchedulerResult<TaskRequest>;
}
