
pub mod settings;

pub use settings::{
    CacheConfig, Config, ConfigError, ProviderConfig, QueueConfig, ServerConfig, UsageConfig,
};

use anyhow::{Context, Result};
use std::path::PathBuf;

pub const CONFIG_DIR_ENV: &str = "CONTEXT_ENGINE_CONFIG_DIR";

/// Resolve the directory holding config.toml and the engine database.
///
/// `CONTEXT_ENGINE_CONFIG_DIR` overrides the platform config directory so
/// deployments can pin state to a known path.
pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let base = dirs::config_dir().context("Could not determine platform config directory")?;
    Ok(base.join("context-engine"))
}
