//! Error types for divert
//!
//! Errors are categorized by subsystem: configuration errors live here,
//! DNS errors in [`crate::dns`], transport errors in [`crate::transport`].

use std::io;

use thiserror::Error;

use crate::dns::DnsError;
use crate::transport::TransportError;

/// Top-level error type for divert
#[derive(Debug, Error)]
pub enum DivertError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule-set construction errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// DNS engine errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Transport dial/listen errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
///
/// These are fatal at startup; the process should exit non-zero rather than
/// run with a partial configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Rule-set construction errors
///
/// Like configuration errors, these are fatal at startup; a reload that
/// fails leaves the previous rule set in place.
#[derive(Debug, Error)]
pub enum RuleError {
    /// A rule list exceeds the size cap
    #[error("Rule list '{list}' exceeds maximum size: {count} rules (max: {max})")]
    TooManyRules {
        list: String,
        count: usize,
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileNotFound {
            path: "/etc/divert/config.json".to_string(),
        };
        assert!(err.to_string().contains("/etc/divert/config.json"));

        let err = ConfigError::ValidationError("invalid suggest level: FAST".to_string());
        assert!(err.to_string().contains("invalid suggest level"));
    }

    #[test]
    fn test_divert_error_from_config() {
        let err: DivertError = ConfigError::ParseError("bad json".to_string()).into();
        assert!(matches!(err, DivertError::Config(_)));
        assert!(err.to_string().contains("bad json"));
    }

    #[test]
    fn test_rule_error_display() {
        let err = RuleError::TooManyRules {
            list: "block".to_string(),
            count: 500_001,
            max: 500_000,
        };
        assert!(err.to_string().contains("block"));
        assert!(err.to_string().contains("500001"));

        let err: DivertError = err.into();
        assert!(matches!(err, DivertError::Rule(_)));
    }
}
