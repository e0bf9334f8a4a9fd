//! Stats sink adapters.

pub mod logging_sink;

pub use logging_sink::LoggingStatsSink;
