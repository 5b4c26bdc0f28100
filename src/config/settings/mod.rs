
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Connection settings for the embedding provider (OpenAI-compatible REST).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: u32,
    pub batch_size: u32,
    pub max_input_tokens: u32,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "nomic-embed-text:latest".to_string(),
            dimension: 768,
            batch_size: 10,
            max_input_tokens: 8000,
            timeout_seconds: 30,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub processing_timeout_seconds: u64,
    pub cleanup_age_hours: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 60000,
            poll_interval_ms: 500,
            processing_timeout_seconds: 300,
            cleanup_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsageConfig {
    pub success_rate_alert_threshold: f64,
    pub token_alert_budget: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            success_rate_alert_threshold: 0.9,
            token_alert_budget: 1_000_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid server port: {0} (must be nonzero)")]
    InvalidPort(u16),
    #[error("Invalid provider URL: {0}")]
    InvalidProviderUrl(String),
    #[error("Invalid model name: {0:?} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidDimension(u32),
    #[error("Invalid batch size: {0} (must be between 1 and 100)")]
    InvalidBatchSize(u32),
    #[error("Invalid input token budget: {0} (must be between 512 and 32000)")]
    InvalidTokenBudget(u32),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid cache capacity: {0} (must be nonzero)")]
    InvalidCacheCapacity(u64),
    #[error("Invalid cache TTL: {0} (must be between 1 and 86400 seconds)")]
    InvalidCacheTtl(u64),
    #[error("Invalid worker count: {0} (must be between 1 and 32)")]
    InvalidWorkerCount(usize),
    #[error("Invalid max attempts: {0} (must be between 1 and 10)")]
    InvalidMaxAttempts(u32),
    #[error("Retry delay range is inverted: initial {0}ms exceeds max {1}ms")]
    InvertedRetryDelays(u64, u64),
    #[error("Invalid success rate threshold: {0} (must be within 0.0..=1.0)")]
    InvalidAlertThreshold(f64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Load config.toml from the given directory, falling back to defaults
    /// when the file does not exist yet.
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        self.provider.validate()?;

        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidCacheCapacity(self.cache.max_entries));
        }
        if self.cache.ttl_seconds == 0 || self.cache.ttl_seconds > 86400 {
            return Err(ConfigError::InvalidCacheTtl(self.cache.ttl_seconds));
        }

        if self.queue.workers == 0 || self.queue.workers > 32 {
            return Err(ConfigError::InvalidWorkerCount(self.queue.workers));
        }
        if self.queue.max_attempts == 0 || self.queue.max_attempts > 10 {
            return Err(ConfigError::InvalidMaxAttempts(self.queue.max_attempts));
        }
        if self.queue.initial_retry_delay_ms > self.queue.max_retry_delay_ms {
            return Err(ConfigError::InvertedRetryDelays(
                self.queue.initial_retry_delay_ms,
                self.queue.max_retry_delay_ms,
            ));
        }

        if !(0.0..=1.0).contains(&self.usage.success_rate_alert_threshold) {
            return Err(ConfigError::InvalidAlertThreshold(
                self.usage.success_rate_alert_threshold,
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }

    /// Path of the SQLite database backing embeddings, jobs, and usage.
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("engine.db")
    }

    #[inline]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ProviderConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if !(64..=4096).contains(&self.dimension) {
            return Err(ConfigError::InvalidDimension(self.dimension));
        }

        if self.batch_size == 0 || self.batch_size > 100 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(512..=32000).contains(&self.max_input_tokens) {
            return Err(ConfigError::InvalidTokenBudget(self.max_input_tokens));
        }

        if self.retry_attempts == 0 || self.retry_attempts > 10 {
            return Err(ConfigError::InvalidRetryAttempts(self.retry_attempts));
        }

        Ok(())
    }

    #[inline]
    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url)
            .map_err(|_| ConfigError::InvalidProviderUrl(self.base_url.clone()))
    }
}
