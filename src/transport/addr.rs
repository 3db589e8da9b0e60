//! Framed target addresses
//!
//! Every tunnelled stream starts with the target the payload is destined
//! for, in a length-prefixed form borrowed from SOCKS5 DOMAINNAME framing:
//! one byte of host length, the host bytes, then a big-endian port. Both
//! sides consume the header before any payload bytes flow.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::TransportError;

/// A `host:port` pair carried in the stream header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    /// Create a target address
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidTarget`] for anything else.
    pub fn parse(target: &str) -> Result<Self, TransportError> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidTarget(target.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidTarget(target.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidTarget(target.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// Encode into the wire form
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidTarget`] when the host does not fit
    /// the one-byte length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let host = self.host.as_bytes();
        if host.is_empty() || host.len() > u8::MAX as usize {
            return Err(TransportError::InvalidTarget(self.to_string()));
        }

        let mut buf = Vec::with_capacity(1 + host.len() + 2);
        buf.push(host.len() as u8);
        buf.extend_from_slice(host);
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }

    /// Write the header to a stream
    ///
    /// # Errors
    ///
    /// Propagates encoding and write failures.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    /// Read a header from a stream
    ///
    /// # Errors
    ///
    /// Propagates read failures; a non-UTF-8 host is reported as
    /// [`TransportError::InvalidTarget`].
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u8().await? as usize;
        if len == 0 {
            return Err(TransportError::InvalidTarget("empty host".to_string()));
        }

        let mut host = vec![0u8; len];
        reader.read_exact(&mut host).await?;
        let host = String::from_utf8(host)
            .map_err(|_| TransportError::InvalidTarget("non-UTF-8 host".to_string()))?;
        let port = reader.read_u16().await?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse() {
        let target = TargetAddr::parse("example.com:443").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);

        assert!(TargetAddr::parse("example.com").is_err());
        assert!(TargetAddr::parse(":443").is_err());
        assert!(TargetAddr::parse("example.com:http").is_err());
    }

    #[test]
    fn test_encode_layout() {
        let buf = TargetAddr::new("example.com", 443).encode().unwrap();
        assert_eq!(buf[0] as usize, "example.com".len());
        assert_eq!(&buf[1..12], b"example.com");
        assert_eq!(&buf[12..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_encode_rejects_oversized_host() {
        let target = TargetAddr::new("a".repeat(256), 80);
        assert!(matches!(
            target.encode(),
            Err(TransportError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_header_round_trip() {
        let target = TargetAddr::new("example.com", 8443);
        let mut writer = Cursor::new(Vec::new());
        target.write_to(&mut writer).await.unwrap();

        let mut cursor = Cursor::new(writer.into_inner());
        let parsed = TargetAddr::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, target);
    }

    #[tokio::test]
    async fn test_header_followed_by_payload() {
        let target = TargetAddr::new("example.com", 80);
        let mut writer = Cursor::new(Vec::new());
        target.write_to(&mut writer).await.unwrap();
        let mut buf = writer.into_inner();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let mut cursor = Cursor::new(buf);
        let parsed = TargetAddr::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, target);

        // Remaining bytes are untouched payload
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut cursor, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut cursor = Cursor::new(vec![11u8, b'e', b'x']);
        assert!(TargetAddr::read_from(&mut cursor).await.is_err());
    }
}
