use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const MIN_REFRESH_MS: u64 = 1_000;
pub const MAX_REFRESH_MS: u64 = 10_000;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub engine: EngineConfig,
    pub services: ServicesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub refresh_rate_ms: u64,
    pub output: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            refresh_rate_ms: 2000,
            output: "text".to_string(),
        }
    }
}

impl GeneralConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_rate_ms.clamp(MIN_REFRESH_MS, MAX_REFRESH_MS))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_buffer_bytes: usize,
    pub buffer_margin_bytes: usize,
    pub max_buffer_retries: u32,
    pub top_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            initial_buffer_bytes: 256 * 1024,
            buffer_margin_bytes: 64 * 1024,
            max_buffer_retries: 4,
            top_n: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub refresh_interval_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        ServicesConfig {
            refresh_interval_secs: 30,
        }
    }
}

impl ServicesConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("proctree").join("config.toml"))
}

/// A config file that exists but does not parse.
#[derive(Debug, Error)]
#[error("invalid config at {}: {source}", path.display())]
pub struct ConfigError {
    pub path: PathBuf,
    #[source]
    pub source: toml::de::Error,
}

/// Load the user config. A missing or unreadable file yields defaults; a file
/// that fails to parse is an error the caller reports once logging is up.
pub fn load_config() -> Result<Config, ConfigError> {
    match config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => Ok(Config::default()),
    }
}

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => Ok(Config::default()),
    }
}
