//! Top-level orchestrator composing the domain ports into the operations
//! the HTTP front end and cron scheduler call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use backoff::backoff::Backoff;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use tracing::warn;

use crate::domain::errors::{SchedulerError, SchedulerResult};
use crate::domain::key_codec::{self, SummaryKey};
use crate::domain::models::result_summary::dedup_sorted;
use crate::domain::models::{
    NewTaskRequest, ResultSummary, RunResult, TaskRequest, TaskState, TaskToRun, MAX_ATTEMPTS,
};
use crate::domain::ports::{
    AuthorizationPolicy, CallerContext, RequestStore, ResultTracker, RunQueue, SchedulerEvent,
    SchedulerSettings, StatsSink,
};

/// Bound on how many queue candidates a single `bot_reap_task` call walks
/// before giving up for this poll.
const REAP_CANDIDATE_LIMIT: u32 = 16;

const SERVER_VERSION: &str = "swarmsched-1";

/// Retry a transactional operation on optimistic-concurrency `Conflict`
/// errors with capped exponential backoff, surfacing the last conflict once
/// the budget is exhausted. Every store method and every `Scheduler`
/// operation in §5's "bounded retry before surfacing Conflict" policy shares
/// this one helper rather than re-implementing backoff ad hoc.
pub async fn with_retries<T, F, Fut>(mut op: F) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let mut backoff = backoff::ExponentialBackoff {
        initial_interval: StdDuration::from_millis(5),
        max_interval: StdDuration::from_millis(50),
        max_elapsed_time: Some(StdDuration::from_millis(250)),
        ..Default::default()
    };
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => match backoff.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

pub struct Scheduler {
    requests: Arc<dyn RequestStore>,
    queue: Arc<dyn RunQueue>,
    results: Arc<dyn ResultTracker>,
    stats: Arc<dyn StatsSink>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        queue: Arc<dyn RunQueue>,
        results: Arc<dyn ResultTracker>,
        stats: Arc<dyn StatsSink>,
        settings: SchedulerSettings,
    ) -> SchedulerResult<Self> {
        settings.validate()?;
        Ok(Self { requests, queue, results, stats, settings })
    }

    /// Emit a stats event; per the propagation policy, a sink failure is
    /// logged and dropped, never surfaced to the caller.
    async fn emit(&self, event: SchedulerEvent) {
        if let Err(err) = self.stats.emit(event).await {
            warn!(%err, "stats sink failed to record event");
        }
    }

    pub async fn schedule_request(
        &self,
        data: NewTaskRequest,
        caller: &CallerContext,
        authz: &dyn AuthorizationPolicy,
    ) -> SchedulerResult<ResultSummary> {
        if !authz.is_allowed(caller, "schedule_request") {
            return Err(SchedulerError::AuthMismatch);
        }
        let request = self.requests.new_request(data).await?;
        let now = Utc::now();

        let summary = match &request.properties_hash {
            Some(hash) => {
                let not_before = now - ChronoDuration::seconds(self.settings.reusable_task_age_secs);
                let candidates = self.results.find_dedup_candidates(hash, not_before).await?;
                match candidates.into_iter().next() {
                    Some(source) => self.build_dedup_summary(&request, &source, now).await?,
                    None => self.schedule_fresh(&request, now).await?,
                }
            }
            None => self.schedule_fresh(&request, now).await?,
        };

        if let Some(parent_raw) = &request.parent_task_id {
            self.link_child(parent_raw, &request.packed_id()).await?;
        }

        self.emit(SchedulerEvent::Schedule { request_id: request.id }).await;
        Ok(summary)
    }

    async fn schedule_fresh(&self, request: &TaskRequest, now: DateTime<Utc>) -> SchedulerResult<ResultSummary> {
        let summary = ResultSummary::new_pending(
            request.id,
            request.name.clone(),
            request.user.clone(),
            now,
            request.properties_hash.clone(),
        );
        let row = TaskToRun::new(
            request.id,
            request.priority,
            request.properties.dimensions.clone(),
            now,
            request.expiration_ts,
        );
        with_retries(|| async {
            self.results.put_summary(summary.clone()).await?;
            self.queue.put(row.clone()).await
        })
        .await?;
        Ok(summary)
    }

    async fn build_dedup_summary(
        &self,
        request: &TaskRequest,
        source: &ResultSummary,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ResultSummary> {
        let source_try = source
            .try_number
            .filter(|&t| t != 0)
            .ok_or_else(|| SchedulerError::Internal("dedup source has no terminal try_number".into()))?;
        let run_key = key_codec::summary_to_run(SummaryKey(source.request_id), source_try)?;
        let deduped_from = key_codec::pack_run_id(run_key)?;
        let cost_saved = source.costs_usd.last().copied().unwrap_or(0.0);

        let summary = ResultSummary::new_pending(
            request.id,
            request.name.clone(),
            request.user.clone(),
            now,
            request.properties_hash.clone(),
        )
        .mark_as_dedup(
            deduped_from,
            cost_saved,
            source.exit_codes.clone(),
            source.durations.clone(),
            source.server_versions.clone(),
            source.bot_id.clone(),
            source.bot_version.clone(),
            source.started_ts,
            source.completed_ts,
            now,
        );
        with_retries(|| async { self.results.put_summary(summary.clone()).await }).await?;
        Ok(summary)
    }

    async fn link_child(&self, parent_packed: &str, child_packed: &str) -> SchedulerResult<()> {
        let parent_key = key_codec::unpack_request_id(parent_packed)?;
        with_retries(|| async {
            let mut parent_summary = self.results.get_summary(parent_key.0).await?;
            parent_summary.add_child(child_packed.to_string());
            self.results.update_summary(&parent_summary).await
        })
        .await
    }

    pub async fn bot_reap_task(
        &self,
        bot_dimensions: &BTreeMap<String, Vec<String>>,
        bot_id: &str,
        bot_version: &str,
    ) -> SchedulerResult<Option<(TaskRequest, RunResult)>> {
        let candidates = self.queue.yield_next_available(bot_dimensions, REAP_CANDIDATE_LIMIT).await?;

        for candidate in candidates {
            if self.results.is_bot_denied(candidate.request_id, bot_id).await? {
                continue;
            }
            if !self.queue.claim(candidate.request_id).await? {
                continue;
            }

            let now = Utc::now();
            let mut summary = self.results.get_summary(candidate.request_id).await?;
            let try_number = summary.try_number.map_or(1, |t| t + 1);
            let run = RunResult::new(
                candidate.request_id,
                try_number,
                bot_id.to_string(),
                bot_version.to_string(),
                SERVER_VERSION.to_string(),
                now,
            )?;

            summary.try_number = Some(try_number);
            summary.bot_id = Some(bot_id.to_string());
            summary.bot_version = Some(bot_version.to_string());
            if summary.started_ts.is_none() {
                summary.started_ts = Some(now);
            }
            summary.transition(TaskState::Running, now)?;

            with_retries(|| async {
                self.results.put_run_result(run.clone()).await?;
                self.results.update_summary(&summary).await
            })
            .await?;

            let request = self.requests.get(candidate.request_id).await?;
            self.emit(SchedulerEvent::Reap {
                request_id: candidate.request_id,
                try_number,
                bot_id: bot_id.to_string(),
            })
            .await;
            return Ok(Some((request, run)));
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn bot_update_task(
        &self,
        request_id: u64,
        try_number: u32,
        bot_id: &str,
        output: &[u8],
        command_index: u32,
        offset: usize,
        exit_code: Option<i32>,
        duration: Option<f64>,
        hard_timeout: bool,
        io_timeout: bool,
        cost_usd: f64,
    ) -> SchedulerResult<(bool, bool)> {
        let mut run = self.results.get_run_result(request_id, try_number).await?;
        if !run.owned_by(bot_id) {
            return Err(SchedulerError::AuthMismatch);
        }

        self.results
            .append_output(
                request_id,
                try_number,
                command_index,
                output,
                offset,
                self.settings.chunk_size,
                self.settings.put_max_content,
            )
            .await?;

        let request = self.requests.get(request_id).await?;
        let is_last_command = (command_index as usize + 1) >= request.properties.commands.len();

        run.cost_usd += cost_usd;
        if let (Some(exit_code), Some(duration)) = (exit_code, duration) {
            run.record_command_result(exit_code, duration);
        }

        let now = Utc::now();
        run.modified_ts = now;

        let terminal = if hard_timeout || io_timeout {
            run.mark_timed_out(now)?;
            true
        } else if exit_code.is_some() && is_last_command {
            run.mark_completed(now)?;
            true
        } else {
            false
        };

        let outcome = with_retries(|| async {
            self.results.update_run_result(&run).await?;
            self.project_run_onto_summary(&run, now).await
        })
        .await;

        match outcome {
            Ok(()) => {
                if terminal {
                    self.emit(SchedulerEvent::Complete {
                        request_id,
                        try_number,
                        failure: run.failure,
                    })
                    .await;
                }
                Ok((true, terminal))
            }
            Err(err) if err.is_conflict() => Ok((false, terminal)),
            Err(err) => Err(err),
        }
    }

    /// `set_from_run_result`: recompute the summary's per-attempt
    /// accumulators from every try up to and including `run`, so the
    /// projection is idempotent under repeated calls with the same
    /// RunResult state.
    async fn project_run_onto_summary(&self, run: &RunResult, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut summary = self.results.get_summary(run.request_id).await?;

        let mut costs_usd = Vec::new();
        let mut exit_codes = Vec::new();
        let mut durations = Vec::new();
        let mut server_versions = Vec::new();
        let mut started_ts = None;
        let mut completed_ts = None;

        for try_number in 1..=run.try_number {
            let attempt = if try_number == run.try_number {
                run.clone()
            } else {
                self.results.get_run_result(run.request_id, try_number).await?
            };
            costs_usd.push(attempt.cost_usd);
            exit_codes.extend(attempt.exit_codes.iter().copied());
            durations.extend(attempt.durations.iter().copied());
            server_versions.extend(attempt.server_versions.iter().cloned());
            started_ts.get_or_insert(attempt.started_ts);
            if attempt.completed_ts.is_some() {
                completed_ts = attempt.completed_ts;
            }
        }

        if summary.try_number.map_or(true, |t| run.try_number > t) {
            summary.try_number = Some(run.try_number);
        }
        summary.costs_usd = costs_usd;
        summary.exit_codes = exit_codes;
        summary.durations = durations;
        summary.server_versions = dedup_sorted(server_versions);
        summary.bot_id = Some(run.bot_id.clone());
        summary.bot_version = Some(run.bot_version.clone());
        if summary.started_ts.is_none() {
            summary.started_ts = started_ts;
        }

        if run.state.is_terminal() {
            summary.failure = run.failure;
            summary.internal_failure = run.internal_failure;
            summary.completed_ts = completed_ts;
            summary.abandoned_ts = run.abandoned_ts;
            summary.transition(run.state, now)?;
        } else {
            summary.modified_ts = now;
        }

        self.results.update_summary(&summary).await
    }

    pub async fn bot_kill_task(&self, request_id: u64, try_number: u32, bot_id: &str) -> SchedulerResult<()> {
        let now = Utc::now();
        with_retries(|| async {
            let mut run = self.results.get_run_result(request_id, try_number).await?;
            if !run.owned_by(bot_id) {
                return Err(SchedulerError::AuthMismatch);
            }
            run.mark_bot_died(now)?;
            self.results.update_run_result(&run).await?;

            let mut summary = self.results.get_summary(request_id).await?;
            summary.internal_failure = true;
            summary.abandoned_ts = Some(now);
            summary.transition(TaskState::BotDied, now)?;
            self.results.update_summary(&summary).await
        })
        .await?;

        self.emit(SchedulerEvent::BotDied {
            request_id,
            try_number,
            bot_id: bot_id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn cancel_task(
        &self,
        request_id: u64,
        caller: &CallerContext,
        authz: &dyn AuthorizationPolicy,
    ) -> SchedulerResult<(bool, bool)> {
        if !authz.is_allowed(caller, "cancel_task") {
            return Err(SchedulerError::AuthMismatch);
        }
        let now = Utc::now();
        let snapshot = self.results.get_summary(request_id).await?;
        if snapshot.state != TaskState::Pending {
            return Ok((false, snapshot.state == TaskState::Running));
        }

        let result = with_retries(|| async {
            let mut summary = self.results.get_summary(request_id).await?;
            if summary.state != TaskState::Pending {
                return Err(SchedulerError::Conflict("ResultSummary", 0));
            }
            // A bot may have already claimed the TaskToRun row and started
            // running between our snapshot read and here; a lost claim
            // means we must not cancel out from under it.
            if !self.queue.claim(request_id).await? {
                return Err(SchedulerError::Conflict("TaskToRun", 0));
            }
            summary.transition(TaskState::Canceled, now)?;
            self.results.update_summary(&summary).await
        })
        .await;

        match result {
            Ok(()) => Ok((true, false)),
            Err(err) if err.is_conflict() => {
                let was_running = self.results.get_summary(request_id).await?.state == TaskState::Running;
                Ok((false, was_running))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn cron_handle_bot_died(&self) -> SchedulerResult<(u64, u64, u64)> {
        let now = Utc::now();
        let tolerance = ChronoDuration::seconds(self.settings.bot_ping_tolerance_secs);
        let stale = self.results.find_stale_running(tolerance, now).await?;

        let mut retried = 0u64;
        let mut terminal = 0u64;
        let mut denied = 0u64;

        for stale_run in stale {
            let request = self.requests.get(stale_run.request_id).await?;
            let expired = request.expiration_ts <= now;

            let retried_this = with_retries(|| async {
                let mut run = stale_run.clone();
                run.mark_bot_died(now)?;
                self.results.update_run_result(&run).await?;
                self.results.deny_bot(run.request_id, &run.bot_id).await?;

                let mut summary = self.results.get_summary(run.request_id).await?;
                if run.try_number < MAX_ATTEMPTS && !expired {
                    summary.transition(TaskState::Pending, now)?;
                    self.results.update_summary(&summary).await?;
                    self.queue.rearm(run.request_id, request.priority, request.created_ts).await?;
                    Ok(true)
                } else {
                    summary.internal_failure = true;
                    summary.abandoned_ts = Some(now);
                    summary.transition(TaskState::BotDied, now)?;
                    self.results.update_summary(&summary).await?;
                    Ok(false)
                }
            })
            .await?;

            denied += 1;
            if retried_this {
                retried += 1;
            } else {
                terminal += 1;
            }
            self.emit(SchedulerEvent::BotDied {
                request_id: stale_run.request_id,
                try_number: stale_run.try_number,
                bot_id: stale_run.bot_id.clone(),
            })
            .await;
        }

        Ok((retried, terminal, denied))
    }

    pub async fn cron_abort_expired_task_to_run(&self) -> SchedulerResult<u64> {
        let now = Utc::now();
        let expired_ids = self.queue.expire_due(now).await?;

        for request_id in &expired_ids {
            let outcome = with_retries(|| async {
                let mut summary = self.results.get_summary(*request_id).await?;
                if summary.state.is_terminal() {
                    return Ok(());
                }
                summary.abandoned_ts = Some(now);
                summary.transition(TaskState::Expired, now)?;
                self.results.update_summary(&summary).await
            })
            .await;

            match outcome {
                Ok(()) => self.emit(SchedulerEvent::Expire { request_id: *request_id }).await,
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }

        Ok(expired_ids.len() as u64)
    }

    /// Deterministic curve capped at 60s; with probability
    /// `probability_of_quick_comeback` returns 1.0 so idle bots re-poll
    /// quickly instead of backing off on an empty queue.
    pub fn exponential_backoff(&self, attempt: u32) -> f64 {
        if rand::thread_rng().gen_bool(self.settings.probability_of_quick_comeback) {
            return 1.0;
        }
        2f64.powi(attempt.min(6) as i32).min(60.0)
    }
}
