//! Domain ports (trait interfaces) for the task scheduling engine.
//!
//! Each trait is implemented once per adapter family (currently just
//! `adapters::sqlite`); the services layer is built against these traits,
//! never against a concrete adapter type.

pub mod request_store;
pub mod result_tracker;
pub mod run_queue;
pub mod settings;
pub mod stats_sink;

pub use request_store::RequestStore;
pub use result_tracker::ResultTracker;
pub use run_queue::RunQueue;
pub use settings::{AllowAll, AuthorizationPolicy, CallerContext, SchedulerSettings};
pub use stats_sink::{SchedulerEvent, StatsSink};
