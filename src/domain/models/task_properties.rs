//! The embedded, content-addressable description of what a task runs.
//!
//! `TaskProperties` is a value type: it is never stored as its own row, only
//! embedded in a [`TaskRequest`](super::task_request::TaskRequest). Its
//! canonical JSON encoding is the input to the dedup fingerprint, so the
//! encoding itself is part of this type's contract, not an implementation
//! detail — see [`TaskProperties::canonical_json`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::domain::errors::{SchedulerError, SchedulerResult};

/// `_MIN_TIMEOUT_SECS` from the original validator.
pub const MIN_TIMEOUT_SECS: i64 = 30;
/// `_ONE_DAY_SECS` from the original validator — a day plus ten seconds of
/// slack for clock skew between the caller and the scheduler.
pub const ONE_DAY_SECS: i64 = 86_410;

/// One `(url, localname)` pair to fetch before running a command.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataRef {
    pub url: String,
    pub localname: String,
}

/// Value type embedded in a [`TaskRequest`](super::task_request::TaskRequest).
///
/// Field set mirrors the closed key set validated by `new_request`:
/// `{commands, data, dimensions, env, execution_timeout_secs,
/// io_timeout_secs, idempotent}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProperties {
    /// Ordered sequence of argv vectors, one per command.
    pub commands: Vec<Vec<String>>,
    /// Files to fetch before execution, canonically sorted by `(url, localname)`.
    pub data: Vec<DataRef>,
    /// Required bot dimensions. A bot matches iff every `(k, v)` here is
    /// present in the bot's `k -> {v...}` mapping.
    pub dimensions: BTreeMap<String, String>,
    /// Environment variables set for every command.
    pub env: BTreeMap<String, String>,
    pub execution_timeout_secs: i64,
    pub io_timeout_secs: i64,
    /// Whether a COMPLETED+success result for this fingerprint may be
    /// reused to short-circuit a future identical request.
    pub idempotent: bool,
}

impl TaskProperties {
    /// Rejects anything the closed validation set in the specification
    /// would reject: empty commands, timeouts outside `[MIN_TIMEOUT_SECS,
    /// ONE_DAY_SECS]`, and `data` that isn't already sorted.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.commands.is_empty() || self.commands.iter().any(Vec::is_empty) {
            return Err(SchedulerError::Validation(
                "commands must be a non-empty list of non-empty argv vectors".into(),
            ));
        }
        let mut sorted_data = self.data.clone();
        sorted_data.sort();
        if sorted_data != self.data {
            return Err(SchedulerError::Validation(
                "data must be sorted by (url, localname)".into(),
            ));
        }
        Self::validate_timeout("execution_timeout_secs", self.execution_timeout_secs)?;
        Self::validate_timeout("io_timeout_secs", self.io_timeout_secs)?;
        Ok(())
    }

    fn validate_timeout(field: &str, secs: i64) -> SchedulerResult<()> {
        if !(MIN_TIMEOUT_SECS..=ONE_DAY_SECS).contains(&secs) {
            return Err(SchedulerError::Validation(format!(
                "{field} must be between {MIN_TIMEOUT_SECS} and {ONE_DAY_SECS} seconds, got {secs}"
            )));
        }
        Ok(())
    }

    /// UTF-8 canonical JSON: `BTreeMap` gives byte-wise sorted keys,
    /// `serde_json`'s default formatter leaves printable ASCII unescaped.
    /// This is the sole input to [`Self::fingerprint`].
    pub fn canonical_json(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// SHA-1 over [`Self::canonical_json`]. Only meaningful when
    /// `idempotent` is true; callers decide whether to store the result.
    pub fn fingerprint(&self) -> SchedulerResult<String> {
        let json = self.canonical_json()?;
        let mut hasher = Sha1::new();
        hasher.update(json.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskProperties {
        TaskProperties {
            commands: vec![vec!["echo".into(), "hi".into()]],
            data: vec![],
            dimensions: BTreeMap::from([("os".into(), "linux".into())]),
            env: BTreeMap::new(),
            execution_timeout_secs: 60,
            io_timeout_secs: 60,
            idempotent: true,
        }
    }

    #[test]
    fn fingerprint_is_stable_across_field_construction_order() {
        let a = sample();
        let mut b = sample();
        b.dimensions.insert("zzz".into(), "last".into());
        a.validate().unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = sample();
        assert_eq!(a.fingerprint().unwrap(), sample().fingerprint().unwrap());
    }

    #[test]
    fn rejects_empty_commands() {
        let mut p = sample();
        p.commands = vec![];
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_unsorted_data() {
        let mut p = sample();
        p.data = vec![
            DataRef { url: "http://b".into(), localname: "b".into() },
            DataRef { url: "http://a".into(), localname: "a".into() },
        ];
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_timeout_below_minimum() {
        let mut p = sample();
        p.execution_timeout_secs = 5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_timeout_above_one_day() {
        let mut p = sample();
        p.io_timeout_secs = ONE_DAY_SECS + 1;
        assert!(p.validate().is_err());
    }
}
