use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub max_workers: usize,
    pub chunk_size: usize,
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
    #[serde(default)]
    pub on_decode_error: DecodeErrorPolicy,
}

fn default_supported_formats() -> Vec<String> {
    vec!["json".to_string(), "csv".to_string(), "txt".to_string()]
}

/// What to do when an entry cannot be decoded according to the file's
/// declared format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Skip the bad entry and keep reading the file.
    #[default]
    Skip,
    /// Abort the whole file with a SourceReadError.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before a worker re-asks for work after NO_WORK.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Ceiling for the idle backoff.
    #[serde(with = "humantime_serde", default = "default_max_idle_interval")]
    pub max_idle_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval: default_poll_interval(),
            max_idle_interval: default_max_idle_interval(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_max_idle_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,

    /// Per-call timeout for protocol exchanges. Dispatched units whose
    /// worker has been silent longer than this are reaped and requeued.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_connections() -> usize {
    16
}

impl NetworkConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string)?;

    let config: Config = serde_yaml::from_str(&yaml_string)?;
    validate_config(&config)?;

    Ok(config)
}

/// Validate every constraint and report all violations at once.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.system.max_workers == 0 {
        errors.push("system.max_workers must be greater than 0".to_string());
    }
    if config.system.chunk_size == 0 {
        errors.push("system.chunk_size must be greater than 0".to_string());
    }
    if config.system.supported_formats.is_empty() {
        errors.push("system.supported_formats must not be empty".to_string());
    }
    for format in &config.system.supported_formats {
        if !matches!(format.as_str(), "json" | "csv" | "txt" | "log") {
            errors.push(format!(
                "system.supported_formats: unknown format '{}' (expected json, csv, txt or log)",
                format
            ));
        }
    }
    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be greater than 0".to_string());
    }
    if config.retry.poll_interval.is_zero() {
        errors.push("retry.poll_interval must be greater than 0".to_string());
    }
    if config.retry.max_idle_interval < config.retry.poll_interval {
        errors.push("retry.max_idle_interval must be >= retry.poll_interval".to_string());
    }
    if config.network.host.is_empty() {
        errors.push("network.host must not be empty".to_string());
    }
    if config.network.timeout.is_zero() {
        errors.push("network.timeout must be greater than 0".to_string());
    }
    if config.network.max_connections == 0 {
        errors.push("network.max_connections must be greater than 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
