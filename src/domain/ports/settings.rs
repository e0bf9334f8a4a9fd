//! The polled settings record (external interfaces §6) and the caller
//! identity/authorization plumbing the redesign flags call for.

use serde::{Deserialize, Serialize};

use crate::domain::errors::{SchedulerError, SchedulerResult};
use crate::domain::models::DEFAULT_CHUNK_SIZE;

/// Options the Scheduler polls from an external settings record.
/// `MAX_ATTEMPTS` is deliberately absent — it's a compile-time constant
/// (`crate::domain::models::MAX_ATTEMPTS`), not something this record
/// configures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub reusable_task_age_secs: i64,
    pub bot_ping_tolerance_secs: i64,
    pub chunk_size: usize,
    pub put_max_content: usize,
    pub put_max_chunks: usize,
    pub fetch_max_content: usize,
    pub probability_of_quick_comeback: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let put_max_chunks = 1024;
        Self {
            reusable_task_age_secs: 24 * 60 * 60,
            bot_ping_tolerance_secs: 5 * 60,
            chunk_size: DEFAULT_CHUNK_SIZE,
            put_max_content: put_max_chunks * DEFAULT_CHUNK_SIZE,
            put_max_chunks,
            fetch_max_content: 50 * 1024 * 1024,
            probability_of_quick_comeback: 0.05,
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.put_max_content != self.put_max_chunks * self.chunk_size {
            return Err(SchedulerError::Validation(format!(
                "put_max_content ({}) must equal put_max_chunks ({}) * chunk_size ({})",
                self.put_max_content, self.put_max_chunks, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.probability_of_quick_comeback) {
            return Err(SchedulerError::Validation(
                "probability_of_quick_comeback must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// The already-authenticated caller identity threaded explicitly through
/// every operation that needs one, replacing the ambient request-local
/// identity the original relied on.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub identity: String,
    pub ip: Option<String>,
}

impl CallerContext {
    pub fn new(identity: impl Into<String>) -> Self {
        Self { identity: identity.into(), ip: None }
    }
}

/// `(identity, action) -> bool`, supplied by the caller. The core never
/// opens its own auth store.
pub trait AuthorizationPolicy: Send + Sync {
    fn is_allowed(&self, caller: &CallerContext, action: &str) -> bool;
}

/// Policy that allows everything — useful for the CLI and for tests where
/// authorization is out of scope.
pub struct AllowAll;

impl AuthorizationPolicy for AllowAll {
    fn is_allowed(&self, _caller: &CallerContext, _action: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_satisfy_their_own_invariant() {
        SchedulerSettings::default().validate().unwrap();
    }

    #[test]
    fn rejects_mismatched_content_budget() {
        let mut settings = SchedulerSettings::default();
        settings.put_max_content += 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_probability_outside_unit_interval() {
        let mut settings = SchedulerSettings::default();
        settings.probability_of_quick_comeback = 1.5;
        assert!(settings.validate().is_err());
    }
}
