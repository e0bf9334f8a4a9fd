//! Infrastructure layer: ambient concerns (configuration, logging) that sit
//! alongside the domain/adapters/services layers without belonging to any
//! of them.

pub mod config;
pub mod logging;
