//! Tunnel transport abstraction
//!
//! A transport turns `dial(relay, target)` into a bidirectional byte pipe to
//! the relay, with the target address framed into the first bytes of the
//! stream, and `listen(addr)` into a stream of accepted pipes with their
//! parsed targets.
//!
//! ```text
//! application TCP -> interceptor -> Transport::dial(relay, target)
//!                                          |
//!                                          v
//!                        [len][host][port BE] + payload bytes
//!                                          |
//!                                          v
//!                     relay: Transport::listen -> (stream, target)
//! ```
//!
//! # Variants
//!
//! | Transport | Session model | Listen |
//! |-----------|---------------|--------|
//! | QUIC      | one cached session, multiplexed streams | yes |
//! | KCP       | one session per dial | yes |
//! | SOCKS5    | client only, handshake deferred to first write | no |

pub mod addr;
mod error;
pub(crate) mod insecure;
pub mod kcp;
pub mod quic;
pub mod socks5;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

pub use addr::TargetAddr;
pub use error::TransportError;
pub use kcp::KcpTransport;
pub use quic::QuicTransport;
pub use socks5::Socks5Transport;

/// A dialing/listening tunnel transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `relay` whose payload is destined for `target`
    ///
    /// The target header is already written (or otherwise conveyed) when
    /// this returns; the caller only pushes payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] tagged with the failing stage.
    async fn dial(&self, relay: &str, target: &TargetAddr)
        -> Result<TransportStream, TransportError>;

    /// Accept tunnelled streams on `addr`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ListenUnsupported`] for client-only
    /// transports, or a listen failure.
    async fn listen(&self, addr: &str) -> Result<Incoming, TransportError>;
}

/// An accepted stream with its parsed target header
pub struct TargetedStream {
    pub stream: TransportStream,
    pub target: TargetAddr,
}

/// Inbound side of a listening transport
pub struct Incoming {
    local_addr: SocketAddr,
    streams: mpsc::Receiver<TargetedStream>,
}

impl Incoming {
    pub(crate) fn new(local_addr: SocketAddr, streams: mpsc::Receiver<TargetedStream>) -> Self {
        Self {
            local_addr,
            streams,
        }
    }

    /// Address the listener is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next accepted stream
    pub async fn next(&mut self) -> Option<TargetedStream> {
        self.streams.recv().await
    }
}

/// Unified stream type over the transport variants
///
/// Delegates `AsyncRead`/`AsyncWrite` to the underlying stream.
pub enum TransportStream {
    Quic(quic::QuicStream),
    Kcp(tokio_kcp::KcpStream),
    Socks5(socks5::Socks5Stream),
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quic(_) => f.write_str("TransportStream::Quic"),
            Self::Kcp(_) => f.write_str("TransportStream::Kcp"),
            Self::Socks5(_) => f.write_str("TransportStream::Socks5"),
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Quic(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Kcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Socks5(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Quic(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Kcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Socks5(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Quic(stream) => Pin::new(stream).poll_flush(cx),
            Self::Kcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Socks5(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Quic(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Kcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Socks5(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Resolve a `host:port` endpoint to a socket address
pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TransportError::Dial {
            addr: addr.to_string(),
            reason: "no addresses resolved".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_socket_addr() {
        let addr = resolve("127.0.0.1:443").await.unwrap();
        assert_eq!(addr, "127.0.0.1:443".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_rejects_garbage() {
        assert!(resolve("not an address").await.is_err());
    }
}
