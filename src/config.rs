//! Application configuration
//!
//! Layered: embedded defaults, then `config/{QUILL_ENV}` and `config/local`
//! files, then `QUILL_*` environment variables.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use quill_canvas::CanvasConfig;
use serde::{Deserialize, Serialize};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL for conversation snapshots
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// POST target for fully displayed documents
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_indexing_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_indexing_timeout_secs(),
        }
    }
}

fn default_indexing_timeout_secs() -> u64 {
    10
}

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let profile = std::env::var("QUILL_ENV").unwrap_or_else(|_| "development".to_string());
    let config = Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{profile}")).required(false))
        .add_source(File::with_name("config/local").required(false))
        // QUILL_CANVAS__REVEAL__CHARS_PER_TICK: single `_` after the prefix, `__` between keys
        .add_source(
            Environment::with_prefix("QUILL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;
    config
        .canvas
        .validate()
        .context("Invalid canvas configuration")?;
    Ok(config)
}
