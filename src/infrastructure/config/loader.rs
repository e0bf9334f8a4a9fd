use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::SchedulerConfig;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("settings invalid: {0}")]
    Settings(#[from] crate::domain::errors::SchedulerError),

    #[error("database url cannot be empty")]
    EmptyDatabaseUrl,

    #[error("database max_connections must be at least 1")]
    InvalidMaxConnections,

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .swarmsched/config.yaml (project config)
    /// 3. .swarmsched/local.yaml (project local overrides, optional)
    /// 4. Environment variables (`SWARMSCHED_*` prefix, highest priority)
    pub fn load() -> Result<SchedulerConfig> {
        let config: SchedulerConfig = Figment::new()
            .merge(Serialized::defaults(SchedulerConfig::default()))
            .merge(Yaml::file(".swarmsched/config.yaml"))
            .merge(Yaml::file(".swarmsched/local.yaml"))
            .merge(Env::prefixed("SWARMSCHED_").split("__"))
            .extract()
            .context("failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, skipping the project-local
    /// discovery used by [`Self::load`]. Used by tests and the CLI's
    /// `--config` flag.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<SchedulerConfig> {
        let config: SchedulerConfig = Figment::new()
            .merge(Serialized::defaults(SchedulerConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &SchedulerConfig) -> Result<(), ConfigError> {
        config.settings.validate()?;

        if config.database.url.is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn yaml_parsing_overrides_defaults() {
        let yaml = r"
settings:
  reusable_task_age_secs: 3600
database:
  url: sqlite:///tmp/custom.db
  max_connections: 5
logging:
  level: debug
  format: pretty
";
        let config: SchedulerConfig = Figment::new()
            .merge(Serialized::defaults(SchedulerConfig::default()))
            .merge(figment::providers::Yaml::string(yaml))
            .extract()
            .expect("yaml should parse");

        assert_eq!(config.settings.reusable_task_age_secs, 3600);
        assert_eq!(config.database.url, "sqlite:///tmp/custom.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.logging.level, "debug");
        ConfigLoader::validate(&config).expect("parsed config should be valid");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = SchedulerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn rejects_empty_database_url() {
        let mut config = SchedulerConfig::default();
        config.database.url = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyDatabaseUrl)
        ));
    }

    #[test]
    fn rejects_zero_max_connections() {
        let mut config = SchedulerConfig::default();
        config.database.max_connections = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConnections)
        ));
    }

    #[test]
    fn env_override_prefix_is_swarmsched() {
        // `Jail` scopes the env mutation to this closure and restores it
        // on exit, without requiring `unsafe` at the call site the way
        // `std::env::set_var` does.
        figment::Jail::expect_with(|jail| {
            jail.set_env("SWARMSCHED_DATABASE__MAX_CONNECTIONS", "25");
            let config: SchedulerConfig = Figment::new()
                .merge(Serialized::defaults(SchedulerConfig::default()))
                .merge(Env::prefixed("SWARMSCHED_").split("__"))
                .extract()?;
            assert_eq!(config.database.max_connections, 25);
            Ok(())
        });
    }
}
