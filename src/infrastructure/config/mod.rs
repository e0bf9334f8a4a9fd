//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - YAML file loading
//! - Environment variable overrides
//! - Configuration validation
//! - Type-safe config structs

mod loader;

pub use loader::{ConfigError, ConfigLoader};

use serde::{Deserialize, Serialize};

use crate::domain::ports::SchedulerSettings;
use crate::infrastructure::logging::LogConfig;

/// Top-level configuration record: the scheduler's own tunables plus the
/// ambient database and logging setup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    pub settings: SchedulerSettings,
    pub database: DatabaseConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:.swarmsched/swarmsched.db".to_string(),
            max_connections: 10,
        }
    }
}
