//! Configuration loading

use std::path::Path;

use tracing::info;

use super::types::Config;
use crate::error::ConfigError;

/// Load and validate a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    let raw = std::fs::read_to_string(path)?;
    let config = load_config_str(&raw)?;
    info!(
        "loaded configuration from {} ({} inbounds, {} outbounds)",
        path.display(),
        config.inbounds.len(),
        config.outbounds.len()
    );
    Ok(config)
}

/// Parse and validate a configuration document.
pub fn load_config_str(raw: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// A minimal working configuration: a dokodemo forward on an ephemeral
/// port, dialing out directly.
#[must_use]
pub fn default_config() -> Config {
    load_config_str(
        r#"{
            "inbounds": [{
                "tag": "door",
                "protocol": "dokodemo-door",
                "listen": "127.0.0.1",
                "port": 10800,
                "settings": { "address": "127.0.0.1", "port": 9000 }
            }],
            "outbounds": [{
                "tag": "direct",
                "protocol": "freedom"
            }]
        }"#,
    )
    .expect("builtin default configuration is valid")
}
