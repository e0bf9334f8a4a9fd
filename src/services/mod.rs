//! Orchestration layer: the `Scheduler` composes the domain ports into the
//! external-facing operations.

pub mod scheduler;

pub use scheduler::{with_retries, Scheduler};
