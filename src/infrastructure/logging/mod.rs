//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber: JSON or pretty
//! formatting to stdout, with optional daily/hourly file rotation.

mod config;
mod logger;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
