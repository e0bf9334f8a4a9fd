//! Domain models for the task scheduling engine.
//!
//! Pure entities and value types with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure
//! concerns (no sqlx, no tracing subscriber setup).

pub mod output_chunk;
pub mod result_summary;
pub mod run_result;
pub mod task_properties;
pub mod task_request;
pub mod task_to_run;

pub use output_chunk::{plan_chunk_spans, Span, TaskOutputChunk, DEFAULT_CHUNK_SIZE};
pub use result_summary::{ResultSummary, TaskState};
pub use run_result::{RunResult, MAX_ATTEMPTS};
pub use task_properties::{DataRef, TaskProperties};
pub use task_request::{NewTaskRequest, TaskRequest};
pub use task_to_run::{encode_queue_number, TaskToRun};
