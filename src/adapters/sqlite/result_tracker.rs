//! SQLite implementation of the `ResultTracker` port.
//!
//! `update_summary`/`update_run_result` use the teacher's `version` column
//! pattern: the caller always operates on a freshly-read row, and the
//! `UPDATE` is guarded on `version = <the version it was read at>` so a
//! racing writer's update is rejected rather than silently lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::domain::errors::{SchedulerError, SchedulerResult};
use crate::domain::key_codec::{self, RequestKey};
use crate::domain::models::{
    plan_chunk_spans, ResultSummary, RunResult, TaskOutputChunk, TaskState,
};
use crate::domain::ports::ResultTracker;

use super::{parse_datetime, parse_optional_datetime};

#[derive(Clone)]
pub struct SqliteResultTracker {
    pool: SqlitePool,
}

impl SqliteResultTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_chunk(
        &self,
        request_id: u64,
        try_number: u32,
        command_index: u32,
        chunk_index: u32,
    ) -> SchedulerResult<TaskOutputChunk> {
        let row: Option<OutputChunkRow> = sqlx::query_as(
            r#"SELECT request_id, try_number, command_index, chunk_index, chunk, gaps
               FROM output_chunks
               WHERE request_id = ? AND try_number = ? AND command_index = ? AND chunk_index = ?"#,
        )
        .bind(request_id as i64)
        .bind(try_number as i64)
        .bind(command_index as i64)
        .bind(chunk_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Ok(TaskOutputChunk::empty(
                request_id,
                try_number,
                command_index,
                chunk_index,
            )),
        }
    }

    async fn save_chunk(&self, chunk: &TaskOutputChunk) -> SchedulerResult<()> {
        let gaps_json = serde_json::to_string(&chunk.gaps)?;
        sqlx::query(
            r#"INSERT INTO output_chunks (request_id, try_number, command_index, chunk_index, chunk, gaps)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT (request_id, try_number, command_index, chunk_index)
               DO UPDATE SET chunk = excluded.chunk, gaps = excluded.gaps"#,
        )
        .bind(chunk.request_id as i64)
        .bind(chunk.try_number as i64)
        .bind(chunk.command_index as i64)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.chunk)
        .bind(&gaps_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultTracker for SqliteResultTracker {
    async fn put_summary(&self, summary: ResultSummary) -> SchedulerResult<()> {
        let costs_json = serde_json::to_string(&summary.costs_usd)?;
        let durations_json = serde_json::to_string(&summary.durations)?;
        let exit_codes_json = serde_json::to_string(&summary.exit_codes)?;
        let server_versions_json = serde_json::to_string(&summary.server_versions)?;
        let children_json = serde_json::to_string(&summary.children_task_ids)?;

        sqlx::query(
            r#"INSERT INTO result_summaries
               (request_id, name, user, state, failure, internal_failure, try_number,
                bot_id, bot_version, created_ts, modified_ts, started_ts, completed_ts,
                abandoned_ts, costs_usd, cost_saved_usd, durations, exit_codes,
                server_versions, deduped_from, properties_hash, children_task_ids, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)"#,
        )
        .bind(summary.request_id as i64)
        .bind(&summary.name)
        .bind(&summary.user)
        .bind(state_str(summary.state))
        .bind(summary.failure)
        .bind(summary.internal_failure)
        .bind(summary.try_number.map(i64::from))
        .bind(&summary.bot_id)
        .bind(&summary.bot_version)
        .bind(summary.created_ts.to_rfc3339())
        .bind(summary.modified_ts.to_rfc3339())
        .bind(summary.started_ts.map(|t| t.to_rfc3339()))
        .bind(summary.completed_ts.map(|t| t.to_rfc3339()))
        .bind(summary.abandoned_ts.map(|t| t.to_rfc3339()))
        .bind(&costs_json)
        .bind(summary.cost_saved_usd)
        .bind(&durations_json)
        .bind(&exit_codes_json)
        .bind(&server_versions_json)
        .bind(&summary.deduped_from)
        .bind(&summary.properties_hash)
        .bind(&children_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_summary(&self, request_id: u64) -> SchedulerResult<ResultSummary> {
        let row: Option<ResultSummaryRow> =
            sqlx::query_as("SELECT * FROM result_summaries WHERE request_id = ?")
                .bind(request_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        let row = row.ok_or_else(|| {
            SchedulerError::NotFound(
                "ResultSummary",
                key_codec::pack_request_id(RequestKey(request_id)),
            )
        })?;
        row.try_into()
    }

    async fn update_summary(&self, summary: &ResultSummary) -> SchedulerResult<()> {
        let costs_json = serde_json::to_string(&summary.costs_usd)?;
        let durations_json = serde_json::to_string(&summary.durations)?;
        let exit_codes_json = serde_json::to_string(&summary.exit_codes)?;
        let server_versions_json = serde_json::to_string(&summary.server_versions)?;
        let children_json = serde_json::to_string(&summary.children_task_ids)?;

        let result = sqlx::query(
            r#"UPDATE result_summaries SET
               state = ?, failure = ?, internal_failure = ?, try_number = ?,
               bot_id = ?, bot_version = ?, modified_ts = ?, started_ts = ?,
               completed_ts = ?, abandoned_ts = ?, costs_usd = ?, cost_saved_usd = ?,
               durations = ?, exit_codes = ?, server_versions = ?, deduped_from = ?,
               properties_hash = ?, children_task_ids = ?, version = version + 1
               WHERE request_id = ? AND version = ?"#,
        )
        .bind(state_str(summary.state))
        .bind(summary.failure)
        .bind(summary.internal_failure)
        .bind(summary.try_number.map(i64::from))
        .bind(&summary.bot_id)
        .bind(&summary.bot_version)
        .bind(summary.modified_ts.to_rfc3339())
        .bind(summary.started_ts.map(|t| t.to_rfc3339()))
        .bind(summary.completed_ts.map(|t| t.to_rfc3339()))
        .bind(summary.abandoned_ts.map(|t| t.to_rfc3339()))
        .bind(&costs_json)
        .bind(summary.cost_saved_usd)
        .bind(&durations_json)
        .bind(&exit_codes_json)
        .bind(&server_versions_json)
        .bind(&summary.deduped_from)
        .bind(&summary.properties_hash)
        .bind(&children_json)
        .bind(summary.request_id as i64)
        .bind(summary.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::Conflict("ResultSummary", 0));
        }
        Ok(())
    }

    async fn find_dedup_candidates(
        &self,
        properties_hash: &str,
        not_before: DateTime<Utc>,
    ) -> SchedulerResult<Vec<ResultSummary>> {
        let rows: Vec<ResultSummaryRow> = sqlx::query_as(
            r#"SELECT * FROM result_summaries
               WHERE properties_hash = ? AND state = 'COMPLETED' AND failure = 0
                 AND created_ts >= ?
               ORDER BY created_ts DESC"#,
        )
        .bind(properties_hash)
        .bind(not_before.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResultSummary::try_from).collect()
    }

    async fn put_run_result(&self, run: RunResult) -> SchedulerResult<()> {
        let durations_json = serde_json::to_string(&run.durations)?;
        let exit_codes_json = serde_json::to_string(&run.exit_codes)?;
        let server_versions_json = serde_json::to_string(&run.server_versions)?;
        let children_json = serde_json::to_string(&run.children_task_ids)?;

        sqlx::query(
            r#"INSERT INTO run_results
               (request_id, try_number, state, failure, internal_failure, bot_id,
                bot_version, started_ts, modified_ts, completed_ts, abandoned_ts,
                cost_usd, durations, exit_codes, server_versions, children_task_ids, version)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)"#,
        )
        .bind(run.request_id as i64)
        .bind(run.try_number as i64)
        .bind(state_str(run.state))
        .bind(run.failure)
        .bind(run.internal_failure)
        .bind(&run.bot_id)
        .bind(&run.bot_version)
        .bind(run.started_ts.to_rfc3339())
        .bind(run.modified_ts.to_rfc3339())
        .bind(run.completed_ts.map(|t| t.to_rfc3339()))
        .bind(run.abandoned_ts.map(|t| t.to_rfc3339()))
        .bind(run.cost_usd)
        .bind(&durations_json)
        .bind(&exit_codes_json)
        .bind(&server_versions_json)
        .bind(&children_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run_result(&self, request_id: u64, try_number: u32) -> SchedulerResult<RunResult> {
        let row: Option<RunResultRow> =
            sqlx::query_as("SELECT * FROM run_results WHERE request_id = ? AND try_number = ?")
                .bind(request_id as i64)
                .bind(try_number as i64)
                .fetch_optional(&self.pool)
                .await?;
        let row = row.ok_or_else(|| {
            SchedulerError::NotFound(
                "RunResult",
                format!("{}/{try_number}", key_codec::pack_request_id(RequestKey(request_id))),
            )
        })?;
        row.try_into()
    }

    async fn update_run_result(&self, run: &RunResult) -> SchedulerResult<()> {
        let durations_json = serde_json::to_string(&run.durations)?;
        let exit_codes_json = serde_json::to_string(&run.exit_codes)?;
        let server_versions_json = serde_json::to_string(&run.server_versions)?;
        let children_json = serde_json::to_string(&run.children_task_ids)?;

        let result = sqlx::query(
            r#"UPDATE run_results SET
               state = ?, failure = ?, internal_failure = ?, modified_ts = ?,
               completed_ts = ?, abandoned_ts = ?, cost_usd = ?, durations = ?,
               exit_codes = ?, server_versions = ?, children_task_ids = ?, version = version + 1
               WHERE request_id = ? AND try_number = ? AND version = ?"#,
        )
        .bind(state_str(run.state))
        .bind(run.failure)
        .bind(run.internal_failure)
        .bind(run.modified_ts.to_rfc3339())
        .bind(run.completed_ts.map(|t| t.to_rfc3339()))
        .bind(run.abandoned_ts.map(|t| t.to_rfc3339()))
        .bind(run.cost_usd)
        .bind(&durations_json)
        .bind(&exit_codes_json)
        .bind(&server_versions_json)
        .bind(&children_json)
        .bind(run.request_id as i64)
        .bind(run.try_number as i64)
        .bind(run.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::Conflict("RunResult", 0));
        }
        Ok(())
    }

    async fn find_stale_running(
        &self,
        tolerance: chrono::Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<RunResult>> {
        let cutoff = now - tolerance;
        let rows: Vec<RunResultRow> = sqlx::query_as(
            "SELECT * FROM run_results WHERE state = 'RUNNING' AND modified_ts <= ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RunResult::try_from).collect()
    }

    async fn append_output(
        &self,
        request_id: u64,
        try_number: u32,
        command_index: u32,
        data: &[u8],
        offset: usize,
        chunk_size: usize,
        put_max_content: usize,
    ) -> SchedulerResult<Vec<TaskOutputChunk>> {
        if offset >= put_max_content {
            warn!(
                request_id,
                try_number,
                command_index,
                offset,
                put_max_content,
                "dropping output bytes past PUT_MAX_CONTENT"
            );
            return Ok(Vec::new());
        }
        let allowed = (put_max_content - offset).min(data.len());
        if allowed < data.len() {
            warn!(
                request_id,
                try_number,
                command_index,
                offset,
                put_max_content,
                dropped_bytes = data.len() - allowed,
                "dropping output bytes past PUT_MAX_CONTENT"
            );
        }
        let data = &data[..allowed];
        let spans = plan_chunk_spans(offset, data, chunk_size);

        let mut touched = Vec::with_capacity(spans.len());
        for (chunk_index, local_offset, slice) in spans {
            let mut chunk = self
                .load_chunk(request_id, try_number, command_index, chunk_index)
                .await?;
            chunk.write(local_offset, slice);
            self.save_chunk(&chunk).await?;
            touched.push(chunk);
        }
        Ok(touched)
    }

    async fn get_output(
        &self,
        request_id: u64,
        try_number: u32,
        command_index: u32,
        fetch_max_content: usize,
    ) -> SchedulerResult<Vec<u8>> {
        let rows: Vec<OutputChunkRow> = sqlx::query_as(
            r#"SELECT request_id, try_number, command_index, chunk_index, chunk, gaps
               FROM output_chunks
               WHERE request_id = ? AND try_number = ? AND command_index = ?
               ORDER BY chunk_index ASC"#,
        )
        .bind(request_id as i64)
        .bind(try_number as i64)
        .bind(command_index as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let chunk: TaskOutputChunk = row.try_into()?;
            out.extend_from_slice(&chunk.chunk);
            if out.len() >= fetch_max_content {
                out.truncate(fetch_max_content);
                break;
            }
        }
        Ok(out)
    }

    async fn deny_bot(&self, request_id: u64, bot_id: &str) -> SchedulerResult<()> {
        sqlx::query("INSERT OR IGNORE INTO bot_denials (request_id, bot_id) VALUES (?, ?)")
            .bind(request_id as i64)
            .bind(bot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_bot_denied(&self, request_id: u64, bot_id: &str) -> SchedulerResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM bot_denials WHERE request_id = ? AND bot_id = ?",
        )
        .bind(request_id as i64)
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

fn state_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "PENDING",
        TaskState::Running => "RUNNING",
        TaskState::Completed => "COMPLETED",
        TaskState::TimedOut => "TIMED_OUT",
        TaskState::BotDied => "BOT_DIED",
        TaskState::Canceled => "CANCELED",
        TaskState::Expired => "EXPIRED",
    }
}

fn parse_state(s: &str) -> SchedulerResult<TaskState> {
    Ok(match s {
        "PENDING" => TaskState::Pending,
        "RUNNING" => TaskState::Running,
        "COMPLETED" => TaskState::Completed,
        "TIMED_OUT" => TaskState::TimedOut,
        "BOT_DIED" => TaskState::BotDied,
        "CANCELED" => TaskState::Canceled,
        "EXPIRED" => TaskState::Expired,
        other => return Err(SchedulerError::Internal(format!("unknown task state {other:?}"))),
    })
}

#[derive(sqlx::FromRow)]
struct ResultSummaryRow {
    request_id: i64,
    name: String,
    user: String,
    state: String,
    failure: bool,
    internal_failure: bool,
    try_number: Option<i64>,
    bot_id: Option<String>,
    bot_version: Option<String>,
    created_ts: String,
    modified_ts: String,
    started_ts: Option<String>,
    completed_ts: Option<String>,
    abandoned_ts: Option<String>,
    costs_usd: String,
    cost_saved_usd: Option<f64>,
    durations: String,
    exit_codes: String,
    server_versions: String,
    deduped_from: Option<String>,
    properties_hash: Option<String>,
    children_task_ids: String,
    version: i64,
}

impl TryFrom<ResultSummaryRow> for ResultSummary {
    type Error = SchedulerError;

    fn try_from(row: ResultSummaryRow) -> Result<Self, Self::Error> {
        Ok(ResultSummary {
            request_id: row.request_id as u64,
            name: row.name,
            user: row.user,
            state: parse_state(&row.state)?,
            failure: row.failure,
            internal_failure: row.internal_failure,
            try_number: row.try_number.map(|n| n as u32),
            bot_id: row.bot_id,
            bot_version: row.bot_version,
            created_ts: parse_datetime(&row.created_ts)?,
            modified_ts: parse_datetime(&row.modified_ts)?,
            started_ts: parse_optional_datetime(row.started_ts)?,
            completed_ts: parse_optional_datetime(row.completed_ts)?,
            abandoned_ts: parse_optional_datetime(row.abandoned_ts)?,
            costs_usd: serde_json::from_str(&row.costs_usd)?,
            cost_saved_usd: row.cost_saved_usd,
            durations: serde_json::from_str(&row.durations)?,
            exit_codes: serde_json::from_str(&row.exit_codes)?,
            server_versions: serde_json::from_str(&row.server_versions)?,
            deduped_from: row.deduped_from,
            properties_hash: row.properties_hash,
            children_task_ids: serde_json::from_str(&row.children_task_ids)?,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunResultRow {
    request_id: i64,
    try_number: i64,
    state: String,
    failure: bool,
    internal_failure: bool,
    bot_id: String,
    bot_version: String,
    started_ts: String,
    modified_ts: String,
    completed_ts: Option<String>,
    abandoned_ts: Option<String>,
    cost_usd: f64,
    durations: String,
    exit_codes: String,
    server_versions: String,
    children_task_ids: String,
    version: i64,
}

impl TryFrom<RunResultRow> for RunResult {
    type Error = SchedulerError;

    fn try_from(row: RunResultRow) -> Result<Self, Self::Error> {
        Ok(RunResult {
            request_id: row.request_id as u64,
            try_number: row.try_number as u32,
            state: parse_state(&row.state)?,
            failure: row.failure,
            internal_failure: row.internal_failure,
            bot_id: row.bot_id,
            bot_version: row.bot_version,
            started_ts: parse_datetime(&row.started_ts)?,
            modified_ts: parse_datetime(&row.modified_ts)?,
            completed_ts: parse_optional_datetime(row.completed_ts)?,
            abandoned_ts: parse_optional_datetime(row.abandoned_ts)?,
            cost_usd: row.cost_usd,
            durations: serde_json::from_str(&row.durations)?,
            exit_codes: serde_json::from_str(&row.exit_codes)?,
            server_versions: serde_json::from_str(&row.server_versions)?,
            children_task_ids: serde_json::from_str(&row.children_task_ids)?,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutputChunkRow {
    request_id: i64,
    try_number: i64,
    command_index: i64,
    chunk_index: i64,
    chunk: Vec<u8>,
    gaps: String,
}

impl TryFrom<OutputChunkRow> for TaskOutputChunk {
    type Error = SchedulerError;

    fn try_from(row: OutputChunkRow) -> Result<Self, Self::Error> {
        Ok(TaskOutputChunk {
            request_id: row.request_id as u64,
            try_number: row.try_number as u32,
            command_index: row.command_index as u32,
            chunk_index: row.chunk_index as u32,
            chunk: row.chunk,
            gaps: serde_json::from_str(&row.gaps)?,
        })
    }
}
