//! Configuration types

use std::net::IpAddr;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::suggest::SuggestLevel;

/// Top-level configuration
///
/// # Example
///
/// ```
/// use divert::config::parse_config;
///
/// let config = parse_config(
///     r#"{
///         "listenIP": "127.0.0.1",
///         "dnsServer": "1.1.1.1",
///         "suggestLevel": "SPEEDUP",
///         "blockList": ["ads.example"],
///         "relay": { "transport": "quic", "address": "relay.example:443" }
///     }"#,
/// )
/// .unwrap();
/// assert_eq!(config.dns_server, "1.1.1.1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Local address used both as the DNS listener and as the A/AAAA
    /// synthesis target for intercepted domains
    #[serde(rename = "listenIP")]
    pub listen_ip: IpAddr,

    /// Initial upstream resolver host (port 53 implied when absent).
    /// Empty means: discover the system default resolver at startup.
    pub dns_server: String,

    /// Suggestion aggressiveness: `DISABLE`, `BLOCK` or `SPEEDUP`
    pub suggest_level: String,

    /// Domains that are always intercepted
    pub block_list: Vec<String>,

    /// Domains intercepted because a probe suggested them
    pub suggest_list: Vec<String>,

    /// Domains that are never intercepted; wins over the other lists
    pub white_list: Vec<String>,

    /// Tunnel relay endpoint
    pub relay: RelayConfig,

    /// Logging options
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            dns_server: String::new(),
            suggest_level: SuggestLevel::Disable.to_string(),
            block_list: Vec::new(),
            suggest_list: Vec::new(),
            white_list: Vec::new(),
            relay: RelayConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an unknown suggest level
    /// or a malformed relay address. These are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.suggest_level()?;

        if !self.relay.address.is_empty() && self.relay_host().is_none() {
            return Err(ConfigError::ValidationError(format!(
                "relay address '{}' is not in host:port form",
                self.relay.address
            )));
        }
        Ok(())
    }

    /// Parse the configured suggest level
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an unknown level.
    pub fn suggest_level(&self) -> Result<SuggestLevel, ConfigError> {
        self.suggest_level.parse()
    }

    /// Host part of the relay address, if one is configured
    ///
    /// This identifier is always added to the white list so DNS for the
    /// relay itself is never intercepted.
    #[must_use]
    pub fn relay_host(&self) -> Option<String> {
        let (host, port) = self.relay.address.rsplit_once(':')?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(host.to_string())
    }
}

/// Relay endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Which transport carries tunnelled streams to the relay
    pub transport: TransportKind,

    /// Relay endpoint as `host:port`
    pub address: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Quic,
            address: String::new(),
        }
    }
}

/// Supported tunnel transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    Kcp,
    Socks5,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.dns_server.is_empty());
    }

    #[test]
    fn test_suggest_level_parse() {
        let mut config = Config::default();
        config.suggest_level = "SPEEDUP".to_string();
        assert_eq!(config.suggest_level().unwrap(), SuggestLevel::Speedup);

        config.suggest_level = "FAST".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relay_host() {
        let mut config = Config::default();
        assert_eq!(config.relay_host(), None);

        config.relay.address = "relay.example:443".to_string();
        assert_eq!(config.relay_host().as_deref(), Some("relay.example"));

        config.relay.address = "relay.example".to_string();
        assert_eq!(config.relay_host(), None);
        assert!(config.validate().is_err());

        config.relay.address = ":443".to_string();
        assert_eq!(config.relay_host(), None);
    }

    #[test]
    fn test_transport_kind_serde() {
        let kind: TransportKind = serde_json::from_str("\"kcp\"").unwrap();
        assert_eq!(kind, TransportKind::Kcp);
        assert_eq!(serde_json::to_string(&TransportKind::Socks5).unwrap(), "\"socks5\"");
    }
}
