use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

use crate::admission::AdmissionSeed;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub batch_policy: BatchPolicy,
    pub admissions: Vec<AdmissionSeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the result log. Memory-only when unset.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// What to do with a save request when some readings fail to decompose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Store nothing unless every reading is valid.
    #[default]
    AllOrNothing,
    /// Store the valid readings and report the rest.
    Partial,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.port == 0 {
            return Err(ConfigError::Invalid("api.port must be non-zero".to_string()));
        }

        let mut seen = HashSet::new();
        for seed in &self.admissions {
            if seed.login_id.trim().is_empty() || seed.admission_id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "admissions entries need a login_id and an admission_id".to_string(),
                ));
            }
            if !seen.insert(seed.login_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "login `{}` has more than one admission",
                    seed.login_id
                )));
            }
        }
        Ok(())
    }
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file did not exist.
    Defaults,
}

/// Load and validate configuration. A missing file yields the defaults.
///
/// Runs before logging is set up, so the caller reports the source.
pub fn load_config(path: &Path) -> Result<(Config, ConfigSource), ConfigError> {
    let (config, source) = match fs::read_to_string(path) {
        Ok(raw) => (serde_yaml::from_str::<Config>(&raw)?, ConfigSource::File),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (Config::default(), ConfigSource::Defaults),
        Err(e) => return Err(e.into()),
    };

    config.validate()?;
    Ok((config, source))
}
