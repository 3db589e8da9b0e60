//! KCP transport
//!
//! Reliable-datagram transport for lossy paths. Sessions run in stream mode
//! with immediate flush on write, a fixed 1350-byte MTU and widened
//! send/receive windows; the ARQ timer stays on the conservative 50 ms
//! interval.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};
use tracing::{debug, error};

use super::addr::TargetAddr;
use super::error::TransportError;
use super::{resolve, Incoming, TargetedStream, Transport, TransportStream};

/// Fixed MTU, headroom for outer UDP/IP framing
const MTU: usize = 1350;

/// Send and receive window sizes, in packets
const SEND_WINDOW: u16 = 1024;
const RECV_WINDOW: u16 = 1024;

/// ARQ update interval in milliseconds
const UPDATE_INTERVAL_MS: i32 = 50;

fn kcp_config() -> KcpConfig {
    let mut config = KcpConfig::default();
    config.mtu = MTU;
    config.stream = true;
    config.wnd_size = (SEND_WINDOW, RECV_WINDOW);
    config.nodelay = KcpNoDelayConfig {
        nodelay: false,
        interval: UPDATE_INTERVAL_MS,
        resend: 0,
        nc: false,
    };
    // No write delay: push segments out as soon as they are written
    config.flush_write = true;
    config
}

/// KCP tunnel transport
#[derive(Debug, Clone, Copy, Default)]
pub struct KcpTransport;

impl KcpTransport {
    /// Create the transport
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for KcpTransport {
    async fn dial(
        &self,
        relay: &str,
        target: &TargetAddr,
    ) -> Result<TransportStream, TransportError> {
        let relay_addr = resolve(relay).await?;
        let mut stream =
            KcpStream::connect(&kcp_config(), relay_addr)
                .await
                .map_err(|e| TransportError::Dial {
                    addr: relay.to_string(),
                    reason: e.to_string(),
                })?;

        target.write_to(&mut stream).await?;
        Ok(TransportStream::Kcp(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Incoming, TransportError> {
        let bind_addr: SocketAddr = addr.parse().map_err(|e| TransportError::Listen {
            addr: addr.to_string(),
            reason: format!("invalid address: {e}"),
        })?;

        let mut listener =
            KcpListener::bind(kcp_config(), bind_addr)
                .await
                .map_err(|e| TransportError::Listen {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Listen {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, peer)) => {
                        debug!(%peer, "new KCP session");
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            match TargetAddr::read_from(&mut stream).await {
                                Ok(target) => {
                                    let accepted = TargetedStream {
                                        stream: TransportStream::Kcp(stream),
                                        target,
                                    };
                                    let _ = tx.send(accepted).await;
                                }
                                Err(err) => debug!(%err, "bad target header on KCP session"),
                            }
                        });
                    }
                    Err(err) => {
                        error!(%err, "KCP accept error");
                        return;
                    }
                }
            }
        });

        Ok(Incoming::new(local_addr, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_config_parameters() {
        let config = kcp_config();
        assert_eq!(config.mtu, MTU);
        assert!(config.stream);
        assert!(config.flush_write);
        assert_eq!(config.wnd_size, (SEND_WINDOW, RECV_WINDOW));
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let transport = KcpTransport::new();
        let mut incoming = transport.listen("127.0.0.1:0").await.unwrap();
        let relay = incoming.local_addr().to_string();

        let target = TargetAddr::new("example.com", 80);
        let mut stream = transport.dial(&relay, &target).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut accepted = incoming.next().await.unwrap();
        assert_eq!(accepted.target, target);

        let mut payload = [0u8; 4];
        accepted.stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");

        accepted.stream.write_all(b"pong").await.unwrap();
        accepted.stream.flush().await.unwrap();

        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"pong");
    }

    #[tokio::test]
    async fn test_listen_rejects_bad_address() {
        let transport = KcpTransport::new();
        assert!(matches!(
            transport.listen("not an address").await,
            Err(TransportError::Listen { .. })
        ));
    }
}
