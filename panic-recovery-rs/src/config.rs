// panic-recovery-rs/src/config.rs
// Configuration loader for the recovery interceptor

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::boundary::HookConfig;
use crate::logging::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub logging: LoggingConfig,
    pub hook: HookConfig,
}

impl RecoveryConfig {
    /// Prefix of environment overrides, e.g. `RECOVERY__LOGGING__LEVEL=debug`
    pub const ENV_PREFIX: &'static str = "RECOVERY";

    /// Loads the configuration from an optional TOML file and the
    /// environment. Keys missing from both keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, Self::ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
