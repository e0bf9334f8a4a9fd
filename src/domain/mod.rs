//! Domain layer for the task scheduling engine.
//!
//! Pure entities, the key codec, and the port traits the services and
//! adapters layers are built against. Nothing in this module touches
//! sqlx, tracing, or any other infrastructure concern directly.

pub mod errors;
pub mod key_codec;
pub mod models;
pub mod ports;

pub use errors::{SchedulerError, SchedulerResult};
