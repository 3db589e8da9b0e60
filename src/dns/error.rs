//! DNS error types

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result alias for DNS operations
pub type DnsResult<T> = Result<T, DnsError>;

/// DNS engine errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// Failed to bind the listener socket
    #[error("Failed to bind DNS listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The listener socket failed in a way retrying cannot fix
    #[error("DNS listener failed: {0}")]
    Listener(#[source] io::Error),

    /// Failed to serialize a DNS message
    #[error("Failed to serialize DNS message: {0}")]
    Serialize(String),

    /// Failed to parse a DNS message
    #[error("Failed to parse DNS message: {0}")]
    Parse(String),

    /// Upstream answered with a zero-length datagram
    #[error("Upstream {upstream} returned an empty response")]
    EmptyResponse { upstream: SocketAddr },

    /// Response arrived from an address other than the queried upstream
    #[error("Response from unexpected source {actual} (expected {expected})")]
    UnexpectedSource {
        expected: SocketAddr,
        actual: SocketAddr,
    },

    /// The exchange did not complete within the deadline
    #[error("DNS exchange with {upstream} timed out after {timeout:?}")]
    Timeout {
        upstream: SocketAddr,
        timeout: Duration,
    },

    /// I/O error during an exchange
    #[error("DNS I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DnsError {
    /// Check if this error is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this failure should kick the upstream discovery task
    ///
    /// An empty response proves the upstream is reachable, just unhelpful,
    /// so it does not trigger re-discovery. Local serialization failures are
    /// our own fault and do not either.
    #[must_use]
    pub fn triggers_discovery(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Io(_) | Self::UnexpectedSource { .. } | Self::Parse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "1.1.1.1:53".parse().unwrap()
    }

    #[test]
    fn test_is_timeout() {
        let err = DnsError::Timeout {
            upstream: addr(),
            timeout: Duration::from_millis(200),
        };
        assert!(err.is_timeout());
        assert!(!DnsError::Parse("truncated".into()).is_timeout());
    }

    #[test]
    fn test_discovery_trigger_classification() {
        assert!(DnsError::Timeout {
            upstream: addr(),
            timeout: Duration::from_millis(200),
        }
        .triggers_discovery());
        assert!(DnsError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))
            .triggers_discovery());

        assert!(!DnsError::EmptyResponse { upstream: addr() }.triggers_discovery());
        assert!(!DnsError::Serialize("oversized".into()).triggers_discovery());
    }
}
