//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::UpstreamConfig;
use crate::config::validation::validate_config;
use crate::error::ConfigError;

/// Load and validate configuration from a file. Files ending in `.json` are
/// read as JSON, everything else as TOML.
pub fn load_config(path: &Path) -> Result<UpstreamConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        parse_json_config(&content)
    } else {
        parse_config(&content)
    }
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<UpstreamConfig, ConfigError> {
    let config: UpstreamConfig = toml::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Parse and validate configuration from a JSON document.
pub fn parse_json_config(content: &str) -> Result<UpstreamConfig, ConfigError> {
    let config: UpstreamConfig = serde_json::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}
