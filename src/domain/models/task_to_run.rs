//! The queue-facing projection of a request: one row per dispatchable
//! attempt slot, carrying the dimension set a bot must satisfy and the
//! `queue_number` used to order the pending pool.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bits reserved for the millisecond timestamp component, matching the id
/// layout in [`crate::domain::key_codec`] so both values compare the same
/// way under (priority, created_ts) ordering.
const TS_BITS: u32 = 47;

/// Encode `(priority, created_ts)` into a single ascending sort key:
/// priority occupies the high bits (ascending priority value means
/// ascending queue_number, i.e. lower numeric priority is served first),
/// creation time breaks ties.
pub fn encode_queue_number(priority: u8, created_ts: DateTime<Utc>) -> u64 {
    let ms = created_ts.timestamp_millis().max(0) as u64 & ((1u64 << TS_BITS) - 1);
    ((priority as u64) << TS_BITS) | ms
}

/// Child of [`TaskRequest`](super::task_request::TaskRequest). `queue_number
/// = None` means claimed or expired — the row is inert but retained for
/// audit/debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskToRun {
    pub request_id: u64,
    pub dimensions: BTreeMap<String, String>,
    pub queue_number: Option<u64>,
    pub expiration_ts: DateTime<Utc>,
}

impl TaskToRun {
    pub fn new(request_id: u64, priority: u8, dimensions: BTreeMap<String, String>, created_ts: DateTime<Utc>, expiration_ts: DateTime<Utc>) -> Self {
        Self {
            request_id,
            dimensions,
            queue_number: Some(encode_queue_number(priority, created_ts)),
            expiration_ts,
        }
    }

    /// A bot's dimension set is `name -> {accepted values}`; a row matches
    /// iff every `(k, v)` in `self.dimensions` is accepted.
    pub fn matches(&self, bot_dimensions: &BTreeMap<String, Vec<String>>) -> bool {
        self.dimensions.iter().all(|(k, v)| {
            bot_dimensions
                .get(k)
                .is_some_and(|accepted| accepted.iter().any(|av| av == v))
        })
    }

    pub fn is_pending(&self) -> bool {
        self.queue_number.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn queue_number_orders_by_priority_first() {
        let now = Utc::now();
        let high_prio = encode_queue_number(0, now);
        let low_prio = encode_queue_number(255, now);
        assert!(high_prio < low_prio);
    }

    #[test]
    fn queue_number_breaks_ties_by_creation_time() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(5);
        assert!(encode_queue_number(50, earlier) < encode_queue_number(50, later));
    }

    #[test]
    fn matches_requires_every_dimension_present_in_bot_set() {
        let row = TaskToRun::new(1, 50, dims(&[("os", "linux")]), Utc::now(), Utc::now());
        let bot = BTreeMap::from([("os".to_string(), vec!["linux".to_string(), "mac".to_string()])]);
        assert!(row.matches(&bot));

        let bot_missing = BTreeMap::from([("os".to_string(), vec!["mac".to_string()])]);
        assert!(!row.matches(&bot_missing));
    }

    #[test]
    fn matches_ignores_extra_bot_dimensions() {
        let row = TaskToRun::new(1, 50, dims(&[("os", "linux")]), Utc::now(), Utc::now());
        let bot = BTreeMap::from([
            ("os".to_string(), vec!["linux".to_string()]),
            ("pool".to_string(), vec!["ci".to_string()]),
        ]);
        assert!(row.matches(&bot));
    }
}
