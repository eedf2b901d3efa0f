//! Configuration loading and management
//!
//! This module handles loading and validating configuration files.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!("Configuration loaded: {} server(s)", config.servers.len());

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let config = Config::default_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = create_temp_config();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].proxy_mode, "zero-overhead");
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/config.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_config_str() {
        let json = r#"{
            "servers": [{
                "name": "server",
                "proxy_listen": "0.0.0.0:20220",
                "proxy_mode": "zero-overhead",
                "wg_endpoint": "127.0.0.1:51820",
                "mtu": 1500
            }]
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.servers[0].name, "server");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_config_invalid_json() {
        let result = load_config_str("not valid json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_rejects_small_mtu() {
        let json = r#"{
            "servers": [{
                "name": "server",
                "proxy_listen": "0.0.0.0:20220",
                "proxy_mode": "zero-overhead",
                "wg_endpoint": "127.0.0.1:51820",
                "mtu": 1279
            }]
        }"#;
        assert!(matches!(
            load_config_str(json),
            Err(ConfigError::MtuTooSmall { mtu: 1279 })
        ));
    }

    #[test]
    fn test_create_default_config_round_trip() {
        let file = NamedTempFile::new().unwrap();
        create_default_config(file.path()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
    }
}
