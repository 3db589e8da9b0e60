//! Transport error types

use std::io;

use thiserror::Error;

/// Transport dial/listen errors
///
/// Variants carry a short context tag describing which stage failed, so a
/// dial failure reads as `session: ...` or `stream: ...` in logs.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Session establishment failed (connect or handshake)
    #[error("session: {0}")]
    Session(String),

    /// Opening a stream on an established session failed
    #[error("stream: {0}")]
    Stream(String),

    /// Plain dial failure
    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// Listener setup failure
    #[error("listen {addr}: {reason}")]
    Listen { addr: String, reason: String },

    /// Server certificate generation or loading failed
    #[error("certificate: {0}")]
    Certificate(String),

    /// Malformed target address
    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    /// SOCKS5 server refused the CONNECT request
    #[error("SOCKS5 handshake failed with reply code {code:#04x}")]
    Socks5Reply { code: u8 },

    /// This transport cannot accept inbound sessions
    #[error("listen not supported by this transport")]
    ListenUnsupported,

    /// I/O error on an established stream
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_tags_in_display() {
        assert!(TransportError::Session("handshake timed out".into())
            .to_string()
            .starts_with("session:"));
        assert!(TransportError::Stream("open timed out".into())
            .to_string()
            .starts_with("stream:"));
    }

    #[test]
    fn test_socks5_reply_carries_code() {
        let err = TransportError::Socks5Reply { code: 0x05 };
        assert!(err.to_string().contains("0x05"));
    }
}
