//! Configuration loading

use std::fs;
use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Load and validate a configuration file
///
/// # Errors
///
/// Returns [`ConfigError`] if the file is missing, unreadable, not valid
/// JSON, or fails validation.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let raw = fs::read_to_string(path)?;
    let config = parse_config(&raw)?;
    debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Parse and validate a configuration document
///
/// # Errors
///
/// Returns [`ConfigError`] if the document is not valid JSON or fails
/// validation.
pub fn parse_config(raw: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = parse_config("{}").unwrap();
        assert!(config.block_list.is_empty());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_full() {
        let config = parse_config(
            r#"{
                "listenIP": "192.168.0.2",
                "dnsServer": "8.8.8.8",
                "suggestLevel": "BLOCK",
                "blockList": ["ads.example", "tracker.example"],
                "suggestList": ["slow.net"],
                "whiteList": ["corp.example"],
                "relay": { "transport": "kcp", "address": "relay.example:443" },
                "log": { "level": "debug" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen_ip.to_string(), "192.168.0.2");
        assert_eq!(config.block_list.len(), 2);
        assert_eq!(config.relay_host().as_deref(), Some("relay.example"));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        let err = parse_config("{").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_suggest_level() {
        let err = parse_config(r#"{"suggestLevel": "TURBO"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert!(err.to_string().contains("TURBO"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/divert.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
