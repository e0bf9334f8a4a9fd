//! Port for the matching/priority queue of dispatchable work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::errors::SchedulerResult;
use crate::domain::models::TaskToRun;

/// Materializes and retires `TaskToRun` rows. `yield_next_available` is
/// intentionally not a stream type in this port — the finite,
/// non-restartable iteration the specification describes is expressed as
/// a bounded candidate fetch the caller walks in priority order, which
/// keeps the trait object-safe.
#[async_trait]
pub trait RunQueue: Send + Sync {
    /// Create the single `TaskToRun` row for a freshly scheduled request.
    /// Skipped entirely on the dedup fast-path.
    async fn put(&self, row: TaskToRun) -> SchedulerResult<()>;

    /// Fetch up to `limit` pending candidates in ascending `queue_number`
    /// order whose dimensions are a subset of `bot_dimensions`. Callers
    /// claim in order and stop at the first successful claim.
    async fn yield_next_available(
        &self,
        bot_dimensions: &BTreeMap<String, Vec<String>>,
        limit: u32,
    ) -> SchedulerResult<Vec<TaskToRun>>;

    /// Atomically transition `queue_number` from non-null to null. `Ok(true)`
    /// iff this call won the race.
    async fn claim(&self, request_id: u64) -> SchedulerResult<bool>;

    /// Re-arm a previously-claimed row for a retry (bot-died path): sets
    /// `queue_number` back to non-null with a fresh encoding.
    async fn rearm(&self, request_id: u64, priority: u8, created_ts: DateTime<Utc>) -> SchedulerResult<()>;

    /// Clear `queue_number` for every row with `expiration_ts <= now`.
    /// Returns the request ids cleared, so the caller can patch each
    /// request's summary to `EXPIRED`.
    async fn expire_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<u64>>;
}
