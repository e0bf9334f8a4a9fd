//! Per-attempt execution record, child of a [`ResultSummary`](super::result_summary::ResultSummary).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{SchedulerError, SchedulerResult};

use super::result_summary::{dedup_sorted, TaskState};

/// The source treats `try_number` values outside `{1,2}` as
/// `NotImplementedError`; this crate keeps it a compile-time constant per
/// the open question in the specification rather than exposing it through
/// `SchedulerSettings`.
pub const MAX_ATTEMPTS: u32 = 2;

/// One execution attempt. `try_number` is the id component under its
/// parent summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub request_id: u64,
    pub try_number: u32,
    pub state: TaskState,
    pub failure: bool,
    pub internal_failure: bool,
    pub bot_id: String,
    pub bot_version: String,
    pub started_ts: DateTime<Utc>,
    pub modified_ts: DateTime<Utc>,
    pub completed_ts: Option<DateTime<Utc>>,
    pub abandoned_ts: Option<DateTime<Utc>>,
    pub cost_usd: f64,
    /// Per-command durations, one slot appended as each command finishes.
    pub durations: Vec<f64>,
    /// Per-command exit codes, same indexing as `durations`.
    pub exit_codes: Vec<i32>,
    pub server_versions: Vec<String>,
    pub children_task_ids: Vec<String>,
    /// Row version as read from storage, guarding `update_run_result`'s
    /// optimistic-concurrency check. Always `0` on a freshly built run that
    /// hasn't round-tripped through a store yet.
    pub version: i64,
}

impl RunResult {
    /// `new_run_result`: state=RUNNING, `started_ts = now`,
    /// `server_versions = [current_server_version]`.
    pub fn new(
        request_id: u64,
        try_number: u32,
        bot_id: String,
        bot_version: String,
        server_version: String,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Self> {
        if try_number == 0 || try_number > MAX_ATTEMPTS {
            return Err(SchedulerError::InvalidTry(try_number));
        }
        Ok(Self {
            request_id,
            try_number,
            state: TaskState::Running,
            failure: false,
            internal_failure: false,
            bot_id,
            bot_version,
            started_ts: now,
            modified_ts: now,
            completed_ts: None,
            abandoned_ts: None,
            cost_usd: 0.0,
            durations: Vec::new(),
            exit_codes: Vec::new(),
            server_versions: vec![server_version],
            children_task_ids: Vec::new(),
            version: 0,
        })
    }

    pub fn owned_by(&self, bot_id: &str) -> bool {
        self.bot_id == bot_id
    }

    pub fn record_command_result(&mut self, exit_code: i32, duration: f64) {
        self.exit_codes.push(exit_code);
        self.durations.push(duration);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.state = self.state.transition_to(TaskState::Completed)?;
        self.failure = self.exit_codes.iter().any(|&c| c != 0);
        self.completed_ts = Some(now);
        self.modified_ts = now;
        Ok(())
    }

    pub fn mark_timed_out(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.state = self.state.transition_to(TaskState::TimedOut)?;
        self.failure = true;
        self.completed_ts = Some(now);
        self.modified_ts = now;
        Ok(())
    }

    /// Bot explicitly giving up (`bot_kill_task`), or the bot-died sweep
    /// declaring this attempt's owner unresponsive.
    pub fn mark_bot_died(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.state = self.state.transition_to(TaskState::BotDied)?;
        self.internal_failure = true;
        self.abandoned_ts = Some(now);
        self.modified_ts = now;
        Ok(())
    }

    pub fn union_server_version(&mut self, version: String) {
        self.server_versions.push(version);
        self.server_versions = dedup_sorted(std::mem::take(&mut self.server_versions));
    }

    pub fn add_child(&mut self, child_id: String) {
        self.children_task_ids.push(child_id);
        self.children_task_ids = dedup_sorted(std::mem::take(&mut self.children_task_ids));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> RunResult {
        RunResult::new(1, 1, "bot-1".into(), "v1".into(), "server-1".into(), Utc::now()).unwrap()
    }

    #[test]
    fn rejects_try_number_zero_or_above_max() {
        assert!(RunResult::new(1, 0, "b".into(), "v".into(), "s".into(), Utc::now()).is_err());
        assert!(RunResult::new(1, 3, "b".into(), "v".into(), "s".into(), Utc::now()).is_err());
    }

    #[test]
    fn completed_failure_reflects_any_nonzero_exit() {
        let mut run = fresh();
        run.record_command_result(0, 0.1);
        run.record_command_result(1, 0.2);
        run.mark_completed(Utc::now()).unwrap();
        assert!(run.failure);
    }

    #[test]
    fn completed_success_when_all_exit_zero() {
        let mut run = fresh();
        run.record_command_result(0, 0.1);
        run.mark_completed(Utc::now()).unwrap();
        assert!(!run.failure);
    }

    #[test]
    fn bot_died_sets_internal_failure() {
        let mut run = fresh();
        run.mark_bot_died(Utc::now()).unwrap();
        assert!(run.internal_failure);
        assert!(run.state.is_terminal());
    }

    #[test]
    fn cannot_transition_out_of_terminal_state() {
        let mut run = fresh();
        run.mark_completed(Utc::now()).unwrap();
        assert!(run.mark_timed_out(Utc::now()).is_err());
    }

    #[test]
    fn owned_by_checks_exact_bot_id() {
        let run = fresh();
        assert!(run.owned_by("bot-1"));
        assert!(!run.owned_by("bot-2"));
    }
}
