//! Swarmsched — a distributed build/test task scheduling engine.
//!
//! Matches dispatchable work against bot capabilities, tracks per-attempt
//! execution state, dedups content-identical idempotent requests, and
//! retries or expires work a bot never finished.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{SchedulerError, SchedulerResult};
pub use services::Scheduler;
