//! The immutable root entity: what a caller asked the scheduler to run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{SchedulerError, SchedulerResult};
use crate::domain::key_codec::{self, RequestKey};

use super::task_properties::TaskProperties;

/// Lower bound on `expiration_ts - created_ts`.
pub const MIN_EXPIRATION_SECS: i64 = 30;
/// Upper bound on `expiration_ts - created_ts` (a day plus clock-skew slack).
pub const MAX_EXPIRATION_SECS: i64 = 86_410;

/// Caller-supplied input to [`crate::domain::ports::request_store::RequestStore::new_request`],
/// validated against the closed key set before a [`TaskRequest`] is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRequest {
    pub name: String,
    pub user: String,
    pub priority: u8,
    pub properties: TaskProperties,
    /// Relative expiration in seconds, as accepted on the wire; stored as
    /// the absolute `expiration_ts`.
    pub scheduling_expiration_secs: i64,
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewTaskRequest {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::Validation("name must not be empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(SchedulerError::Validation("user must not be empty".into()));
        }
        if !(MIN_EXPIRATION_SECS..=MAX_EXPIRATION_SECS).contains(&self.scheduling_expiration_secs)
        {
            return Err(SchedulerError::Validation(format!(
                "scheduling_expiration_secs must be between {MIN_EXPIRATION_SECS} and \
                 {MAX_EXPIRATION_SECS}, got {}",
                self.scheduling_expiration_secs
            )));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(SchedulerError::Validation(
                "tags must not contain empty strings".into(),
            ));
        }
        self.properties.validate()
    }
}

/// Immutable after creation. `id` is the bijectively-encoded 64-bit key
/// defined in [`crate::domain::key_codec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: u64,
    pub created_ts: DateTime<Utc>,
    pub name: String,
    pub user: String,
    pub priority: u8,
    pub expiration_ts: DateTime<Utc>,
    pub parent_task_id: Option<String>,
    pub tags: Vec<String>,
    pub properties: TaskProperties,
    /// `Some` only when `properties.idempotent` was true at creation time.
    pub properties_hash: Option<String>,
}

impl TaskRequest {
    /// Assemble a request from already-validated input and an already-
    /// allocated id. Computes `properties_hash` per the idempotent rule.
    pub fn build(input: NewTaskRequest, id: u64, created_ts: DateTime<Utc>) -> SchedulerResult<Self> {
        let expiration_ts = created_ts
            + chrono::Duration::seconds(input.scheduling_expiration_secs);
        let properties_hash = if input.properties.idempotent {
            Some(input.properties.fingerprint()?)
        } else {
            None
        };
        Ok(Self {
            id,
            created_ts,
            name: input.name,
            user: input.user,
            priority: input.priority,
            expiration_ts,
            parent_task_id: input.parent_task_id,
            tags: input.tags,
            properties: input.properties,
            properties_hash,
        })
    }

    pub fn packed_id(&self) -> String {
        key_codec::pack_request_id(RequestKey(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn input() -> NewTaskRequest {
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
            tags: vec![],
        }
    }

    #[test]
    fn build_computes_absolute_expiration() {
        let now = Utc::now();
        let req = TaskRequest::build(input(), 0x100, now).unwrap();
        assert_eq!(req.expiration_ts, now + chrono::Duration::seconds(60));
        assert!(req.properties_hash.is_none());
    }

    #[test]
    fn idempotent_request_gets_a_hash() {
        let mut data = input();
        data.properties.idempotent = true;
        let req = TaskRequest::build(data, 0x200, Utc::now()).unwrap();
        assert!(req.properties_hash.is_some());
    }

    #[test]
    fn rejects_expiration_out_of_bounds() {
        let mut data = input();
        data.scheduling_expiration_secs = 5;
        assert!(data.validate().is_err());
    }

    #[test]
    fn rejects_empty_name() {
        let mut data = input();
        data.name = String::new();
        assert!(data.validate().is_err());
    }
}
