use serde::{Deserialize, Serialize};

use super::errors::ConfigError;
use super::logging::LoggingConfig;
use super::upstream::UpstreamConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Endpoint URL replacing the configured address and protocol.
    pub upstream: Option<String>,
    pub log_level: Option<String>,
    pub idle_timeout_ms: Option<u64>,
    pub max_conns: Option<usize>,
}

impl Config {
    /// Load configuration from file or use defaults
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. ferrous-upstream.toml in current directory
    /// 3. /etc/ferrous-upstream/config.toml
    /// 4. Default configuration
    pub fn load(path: Option<&str>, cli_overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if std::path::Path::new("ferrous-upstream.toml").exists() {
            Self::from_file("ferrous-upstream.toml")?
        } else if std::path::Path::new("/etc/ferrous-upstream/config.toml").exists() {
            Self::from_file("/etc/ferrous-upstream/config.toml")?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(cli_overrides)?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) -> Result<(), ConfigError> {
        if let Some(endpoint) = overrides.upstream {
            self.upstream.apply_endpoint(&endpoint)?;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(idle) = overrides.idle_timeout_ms {
            self.upstream.idle_timeout_ms = idle;
        }
        if let Some(max_conns) = overrides.max_conns {
            self.upstream.max_conns = max_conns;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream.validate()
    }
}
