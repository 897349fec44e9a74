//! TOML configuration for the state machine engine.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Engine configuration loaded from TOML.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied to async delegate tasks that carry none.
    pub default_async_task_timeout_ms: u64,

    /// Timeout applied to synchronous delegate tasks that carry none.
    pub default_sync_task_timeout_ms: u64,

    /// Expiry applied to states that declare no timeout of their own.
    pub default_state_timeout_ms: u64,

    /// Capacity of the progress event broadcast channel.
    pub progress_channel_capacity: usize,

    /// Maximum number of state invocations running at once.
    pub max_concurrent_invocations: usize,

    /// Number of finished instances whose outcome stays queryable; older
    /// records are evicted first.
    pub finished_instance_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_async_task_timeout_ms: 600_000,
            default_sync_task_timeout_ms: 60_000,
            default_state_timeout_ms: 14_400_000,
            progress_channel_capacity: 100,
            max_concurrent_invocations: 64,
            finished_instance_retention: 1_000,
        }
    }
}

impl EngineConfig {
    /// Default async task timeout as a `Duration`.
    #[must_use]
    pub const fn async_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_async_task_timeout_ms)
    }

    /// Default sync task timeout as a `Duration`.
    #[must_use]
    pub const fn sync_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_sync_task_timeout_ms)
    }

    /// Default state expiry as a `Duration`.
    #[must_use]
    pub const fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.default_state_timeout_ms)
    }
}

/// Configuration loader for engine settings.
pub struct EngineConfigLoader;

impl EngineConfigLoader {
    /// Loads engine configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<EngineConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates engine configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if the text cannot be parsed or validated.
    pub fn from_toml_str(content: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validates engine configuration.
    ///
    /// # Arguments
    /// * `config` - Configuration to validate
    ///
    /// # Errors
    /// Returns error if configuration is invalid.
    pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
        if config.default_async_task_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "default_async_task_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if config.default_sync_task_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "default_sync_task_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if config.default_state_timeout_ms < config.default_async_task_timeout_ms {
            return Err(ConfigError::Validation(format!(
                "default_state_timeout_ms ({}) must be >= default_async_task_timeout_ms ({})",
                config.default_state_timeout_ms, config.default_async_task_timeout_ms
            )));
        }
        if config.progress_channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "progress_channel_capacity must be greater than 0".to_string(),
            ));
        }
        if config.max_concurrent_invocations == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_invocations must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
