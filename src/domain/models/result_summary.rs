//! The state machine shared by [`ResultSummary`] and
//! [`RunResult`](super::run_result::RunResult), and the per-request
//! singleton summary itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::errors::{SchedulerError, SchedulerResult};

/// Lifecycle state shared by `ResultSummary` and `RunResult` rows. Table
/// comes from the component design's transition table: every state but
/// `PENDING`/`RUNNING` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    TimedOut,
    BotDied,
    Canceled,
    Expired,
}

impl TaskState {
    /// States reachable directly from `self` under normal operation.
    pub fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Running, Self::Canceled, Self::Expired],
            Self::Running => &[Self::Completed, Self::TimedOut, Self::BotDied, Self::Pending],
            Self::Completed
            | Self::TimedOut
            | Self::BotDied
            | Self::Canceled
            | Self::Expired => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn can_transition_to(self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Validated transition. Returns an error describing the rejected
    /// transition rather than panicking, since both stores and the
    /// scheduler call this on caller-driven input.
    pub fn transition_to(self, target: Self) -> SchedulerResult<Self> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(SchedulerError::Validation(format!(
                "invalid state transition {self:?} -> {target:?}"
            )))
        }
    }

    /// Bypass transition validation. Used only by the bot-died and expire
    /// sweeps, which drive state from elapsed wall-clock time rather than a
    /// caller-asserted event, and by the dedup fast-path which constructs an
    /// already-terminal summary directly.
    pub fn force_to(target: Self) -> Self {
        warn!(?target, "forcing task state without transition validation");
        target
    }
}

/// One per `TaskRequest`, covering all of its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub request_id: u64,
    pub name: String,
    pub user: String,
    pub state: TaskState,
    pub failure: bool,
    pub internal_failure: bool,
    /// `None` while pending; `0` for a dedup hit; `1` or `2` otherwise.
    pub try_number: Option<u32>,
    pub bot_id: Option<String>,
    pub bot_version: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub modified_ts: DateTime<Utc>,
    pub started_ts: Option<DateTime<Utc>>,
    pub completed_ts: Option<DateTime<Utc>>,
    pub abandoned_ts: Option<DateTime<Utc>>,
    pub costs_usd: Vec<f64>,
    pub cost_saved_usd: Option<f64>,
    pub durations: Vec<f64>,
    pub exit_codes: Vec<i32>,
    pub server_versions: Vec<String>,
    /// RunResult packed id this summary was deduped from, if any.
    pub deduped_from: Option<String>,
    /// Non-null only while this summary is itself eligible to source a
    /// future dedup (i.e. never set on a summary that is itself a dedup).
    pub properties_hash: Option<String>,
    pub children_task_ids: Vec<String>,
    /// Row version as read from storage, guarding `update_summary`'s
    /// optimistic-concurrency check. Always `0` on a freshly built summary
    /// that hasn't round-tripped through a store yet.
    pub version: i64,
}

impl ResultSummary {
    /// `new_summary`: state=PENDING, lists empty, hash copied from the
    /// request iff idempotent.
    pub fn new_pending(request_id: u64, name: String, user: String, created_ts: DateTime<Utc>, properties_hash: Option<String>) -> Self {
        Self {
            request_id,
            name,
            user,
            state: TaskState::Pending,
            failure: false,
            internal_failure: false,
            try_number: None,
            bot_id: None,
            bot_version: None,
            created_ts,
            modified_ts: created_ts,
            started_ts: None,
            completed_ts: None,
            abandoned_ts: None,
            costs_usd: Vec::new(),
            cost_saved_usd: None,
            durations: Vec::new(),
            exit_codes: Vec::new(),
            server_versions: Vec::new(),
            deduped_from: None,
            properties_hash,
            children_task_ids: Vec::new(),
            version: 0,
        }
    }

    /// Record a dedup hit: no TaskToRun is ever created for this summary,
    /// and it can never itself source a further dedup.
    pub fn mark_as_dedup(
        mut self,
        source_run_id: String,
        cost_saved_usd: f64,
        exit_codes: Vec<i32>,
        durations: Vec<f64>,
        server_versions: Vec<String>,
        bot_id: Option<String>,
        bot_version: Option<String>,
        started_ts: Option<DateTime<Utc>>,
        completed_ts: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        self.state = TaskState::force_to(TaskState::Completed);
        self.failure = false;
        self.try_number = Some(0);
        self.deduped_from = Some(source_run_id);
        self.cost_saved_usd = Some(cost_saved_usd);
        self.exit_codes = exit_codes;
        self.durations = durations;
        self.server_versions = dedup_sorted(server_versions);
        self.bot_id = bot_id;
        self.bot_version = bot_version;
        self.started_ts = started_ts;
        self.completed_ts = completed_ts;
        self.properties_hash = None;
        self.modified_ts = now;
        self
    }

    pub fn add_child(&mut self, child_id: String) {
        self.children_task_ids.push(child_id);
        self.children_task_ids.sort();
        self.children_task_ids.dedup();
    }

    pub fn transition(&mut self, target: TaskState, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.state = self.state.transition_to(target)?;
        self.modified_ts = now;
        Ok(())
    }
}

pub(crate) fn dedup_sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_go_to_running_canceled_or_expired() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Running));
        assert!(TaskState::Pending.can_transition_to(TaskState::Canceled));
        assert!(TaskState::Pending.can_transition_to(TaskState::Expired));
        assert!(!TaskState::Pending.can_transition_to(TaskState::Completed));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [
            TaskState::Completed,
            TaskState::TimedOut,
            TaskState::BotDied,
            TaskState::Canceled,
            TaskState::Expired,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskState::Running));
        }
    }

    #[test]
    fn running_can_return_to_pending_for_a_retry() {
        assert!(TaskState::Running.can_transition_to(TaskState::Pending));
    }

    #[test]
    fn transition_to_rejects_invalid_moves() {
        let mut summary = ResultSummary::new_pending(1, "n".into(), "u".into(), Utc::now(), None);
        let err = summary.transition(TaskState::Completed, Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn dedup_marking_clears_properties_hash_and_sets_try_zero() {
        let summary = ResultSummary::new_pending(1, "n".into(), "u".into(), Utc::now(), Some("hash".into()));
        let deduped = summary.mark_as_dedup(
            "run-id".into(),
            0.1,
            vec![0],
            vec![0.1],
            vec!["v1".into()],
            Some("bot-1".into()),
            Some("v1".into()),
            Some(Utc::now()),
            Some(Utc::now()),
            Utc::now(),
        );
        assert_eq!(deduped.try_number, Some(0));
        assert_eq!(deduped.state, TaskState::Completed);
        assert!(!deduped.failure);
        assert!(deduped.properties_hash.is_none());
        assert_eq!(deduped.deduped_from.as_deref(), Some("run-id"));
    }

    #[test]
    fn children_task_ids_stay_sorted_and_deduplicated() {
        let mut summary = ResultSummary::new_pending(1, "n".into(), "u".into(), Utc::now(), None);
        summary.add_child("c2".into());
        summary.add_child("c1".into());
        summary.add_child("c1".into());
        assert_eq!(summary.children_task_ids, vec!["c1".to_string(), "c2".to_string()]);
    }
}
