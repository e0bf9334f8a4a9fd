//! Port for per-request summaries, per-attempt run results, and streamed
//! output chunks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::SchedulerResult;
use crate::domain::models::{ResultSummary, RunResult, TaskOutputChunk};

#[async_trait]
pub trait ResultTracker: Send + Sync {
    async fn put_summary(&self, summary: ResultSummary) -> SchedulerResult<()>;

    async fn get_summary(&self, request_id: u64) -> SchedulerResult<ResultSummary>;

    async fn update_summary(&self, summary: &ResultSummary) -> SchedulerResult<()>;

    /// COMPLETED, non-failing summaries matching `properties_hash`,
    /// created no earlier than `not_before`, most recent first — the
    /// dedup fast-path's candidate list.
    async fn find_dedup_candidates(
        &self,
        properties_hash: &str,
        not_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<ResultSummary>>;

    async fn put_run_result(&self, run: RunResult) -> SchedulerResult<()>;

    async fn get_run_result(&self, request_id: u64, try_number: u32) -> SchedulerResult<RunResult>;

    async fn update_run_result(&self, run: &RunResult) -> SchedulerResult<()>;

    /// All RunResults still in RUNNING with `modified_ts + tolerance <=
    /// now` — candidates for the bot-died sweep.
    async fn find_stale_running(
        &self,
        tolerance: chrono::Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<RunResult>>;

    /// Read-modify-write the touched chunks for one logical write. Returns
    /// the dirty chunks so the caller can batch-commit them with the
    /// RunResult update in one transaction.
    async fn append_output(
        &self,
        request_id: u64,
        try_number: u32,
        command_index: u32,
        data: &[u8],
        offset: usize,
        chunk_size: usize,
        put_max_content: usize,
    ) -> SchedulerResult<Vec<TaskOutputChunk>>;

    /// Concatenate chunks in order up to `fetch_max_content`.
    async fn get_output(
        &self,
        request_id: u64,
        try_number: u32,
        command_index: u32,
        fetch_max_content: usize,
    ) -> SchedulerResult<Vec<u8>>;

    /// Record that `bot_id` owned a now-`BOT_DIED` attempt for
    /// `request_id`; it must never be handed the retry for that request.
    async fn deny_bot(&self, request_id: u64, bot_id: &str) -> SchedulerResult<()>;

    /// Whether `bot_id` is on the deny list for `request_id`.
    async fn is_bot_denied(&self, request_id: u64, bot_id: &str) -> SchedulerResult<bool>;
}
