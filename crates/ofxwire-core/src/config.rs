//! Client configuration loading
//!
//! Configuration comes from defaults, a TOML or JSON file, and optional
//! partial overrides merged on top.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::decoder::DecoderConfig;
use crate::error::{Error, Result};
use crate::http::{DispatcherConfig, PoolOverrides, RetryOverrides, TimeoutOverrides};
use crate::logging::LoggingConfig;

/// Top-level configuration for [`crate::OfxClient`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub dispatcher: DispatcherConfig,
    pub decoder: DecoderConfig,
    /// Used by [`crate::logging::init_logging`] when the host application asks for it
    pub logging: LoggingConfig,
    /// Lifetime handed to the response cache on `set`
    pub cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            decoder: DecoderConfig::default(),
            logging: LoggingConfig::default(),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        self.decoder.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Merge partial overrides over this configuration
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(timeouts) = &overrides.timeouts {
            self.dispatcher.timeouts = timeouts.apply_to_all(&self.dispatcher.timeouts);
        }
        if let Some(retry) = &overrides.retry {
            self.dispatcher.retry = retry.apply_to(&self.dispatcher.retry);
        }
        if let Some(pool) = &overrides.pool {
            self.dispatcher.pool = pool.apply_to(&self.dispatcher.pool);
        }
        self
    }

    /// Write as TOML or JSON depending on the extension
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = match Format::of(path) {
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| Error::configuration(format!("Failed to serialize config: {}", e)))?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Partial settings applied with [`ClientConfig::with_overrides`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    /// Applied to every operation class
    pub timeouts: Option<TimeoutOverrides>,
    pub retry: Option<RetryOverrides>,
    pub pool: Option<PoolOverrides>,
}

enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

/// Load and validate a configuration file (`.toml`, otherwise JSON)
pub fn load_config(path: impl AsRef<Path>) -> Result<ClientConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::configuration(format!("Failed to read config {}: {}", path.display(), e))
    })?;

    match Format::of(path) {
        Format::Toml => from_toml_str(&content),
        Format::Json => from_json_str(&content),
    }
}

pub fn from_toml_str(content: &str) -> Result<ClientConfig> {
    let config: ClientConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn from_json_str(content: &str) -> Result<ClientConfig> {
    let config: ClientConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}
