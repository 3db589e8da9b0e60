//! QUIC transport
//!
//! The client side keeps at most one QUIC session and multiplexes every
//! dialled stream onto it. The session is established lazily on the first
//! dial, revalidated before reuse and dropped on any stream-open failure,
//! so the next dial starts clean.
//!
//! ```text
//! dial -> cached session? --no--> connect (1 s handshake deadline)
//!              |                        |
//!             yes                       v
//!              +------------> open_bi (1 s deadline) -> framed stream
//! ```
//!
//! The server side accepts sessions and serves each session's streams
//! concurrently, parsing the target header per stream. Its certificate is a
//! per-process self-signed throwaway: TLS is obfuscation and multiplexing
//! here, not authentication, and the client accepts any certificate.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::time::timeout;
use tracing::debug;

use super::addr::TargetAddr;
use super::error::TransportError;
use super::{insecure, resolve, Incoming, TargetedStream, Transport, TransportStream};

/// ALPN tag spoken on both sides of the tunnel
const ALPN: &[u8] = b"divert";

/// Deadline for establishing a new session
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for opening a stream on an established session
const STREAM_TIMEOUT: Duration = Duration::from_secs(1);

/// Session idle timeout
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keep-alive ping interval, well under the idle timeout
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Cap on concurrently open inbound streams per session
const MAX_INCOMING_STREAMS: u32 = 1024;

/// A QUIC bidirectional stream bound to its session
///
/// Holding the [`Connection`] keeps the session alive for as long as any
/// stream on it is in use.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    connection: Connection,
}

impl QuicStream {
    fn new(send: SendStream, recv: RecvStream, connection: Connection) -> Self {
        Self {
            send,
            recv,
            connection,
        }
    }

    /// Stable ID of the underlying session
    #[must_use]
    pub fn stable_id(&self) -> usize {
        self.connection.stable_id()
    }

    /// Remote address of the underlying session
    #[must_use]
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Check if the underlying session has closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }
}

impl std::fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicStream")
            .field("stable_id", &self.stable_id())
            .field("remote_address", &self.remote_address())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        use std::future::Future;

        let max_len = buf.remaining();
        if max_len == 0 {
            return Poll::Ready(Ok(()));
        }

        // read_chunk returns owned bytes, which sidesteps borrowing the
        // caller's buffer across the await point
        let recv = &mut self.recv;
        let read_fut = recv.read_chunk(max_len, true);
        let mut pinned = std::pin::pin!(read_fut);

        match pinned.as_mut().poll(cx) {
            Poll::Ready(Ok(Some(chunk))) => {
                buf.put_slice(&chunk.bytes);
                Poll::Ready(Ok(()))
            }
            // Stream finished (EOF)
            Poll::Ready(Ok(None)) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("QUIC read error: {e}"),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("QUIC write error: {e}")))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("QUIC flush error: {e}")))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_shutdown(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("QUIC shutdown error: {e}")))
    }
}

/// QUIC tunnel transport
///
/// # Example
///
/// ```no_run
/// use divert::transport::{QuicTransport, TargetAddr, Transport};
///
/// # async fn example() -> Result<(), divert::transport::TransportError> {
/// let transport = QuicTransport::new();
/// let target = TargetAddr::new("example.com", 443);
/// let stream = transport.dial("relay.example:8443", &target).await?;
/// # Ok(())
/// # }
/// ```
pub struct QuicTransport {
    endpoint: OnceCell<Endpoint>,
    session: Mutex<Option<Connection>>,
}

impl QuicTransport {
    /// Create a transport with no session yet
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoint: OnceCell::new(),
            session: Mutex::new(None),
        }
    }

    async fn endpoint(&self) -> Result<&Endpoint, TransportError> {
        self.endpoint
            .get_or_try_init(|| async {
                let bind: SocketAddr = (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into();
                let mut endpoint = Endpoint::client(bind)
                    .map_err(|e| TransportError::Session(format!("endpoint: {e}")))?;
                endpoint.set_default_client_config(client_config()?);
                Ok(endpoint)
            })
            .await
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QuicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for QuicTransport {
    async fn dial(
        &self,
        relay: &str,
        target: &TargetAddr,
    ) -> Result<TransportStream, TransportError> {
        let relay_addr = resolve(relay).await?;
        let server_name = sni_host(relay);

        let mut session = self.session.lock().await;
        let connection = match session.as_ref().filter(|c| c.close_reason().is_none()) {
            Some(connection) => connection.clone(),
            None => {
                let endpoint = self.endpoint().await?;
                let connecting = endpoint
                    .connect(relay_addr, server_name)
                    .map_err(|e| TransportError::Session(e.to_string()))?;
                let connection = match timeout(HANDSHAKE_TIMEOUT, connecting).await {
                    Ok(Ok(connection)) => connection,
                    Ok(Err(e)) => return Err(TransportError::Session(e.to_string())),
                    Err(_) => return Err(TransportError::Session("handshake timed out".into())),
                };
                debug!(remote = %connection.remote_address(), "QUIC session established");
                *session = Some(connection.clone());
                connection
            }
        };

        let (send, recv) = match timeout(STREAM_TIMEOUT, connection.open_bi()).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                *session = None;
                return Err(TransportError::Stream(e.to_string()));
            }
            Err(_) => {
                *session = None;
                return Err(TransportError::Stream("stream open timed out".into()));
            }
        };
        drop(session);

        let mut stream = QuicStream::new(send, recv, connection);
        target.write_to(&mut stream).await?;
        Ok(TransportStream::Quic(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Incoming, TransportError> {
        let bind_addr: SocketAddr = addr.parse().map_err(|e| TransportError::Listen {
            addr: addr.to_string(),
            reason: format!("invalid address: {e}"),
        })?;

        let endpoint =
            Endpoint::server(server_config()?, bind_addr).map_err(|e| TransportError::Listen {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = endpoint.local_addr().map_err(|e| TransportError::Listen {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            debug!(remote = %connection.remote_address(), "new QUIC session");
                            serve_session(connection, tx).await;
                        }
                        Err(err) => debug!(%err, "QUIC handshake failed"),
                    }
                });
            }
        });

        Ok(Incoming::new(local_addr, rx))
    }
}

/// Accept streams on one session until it closes
async fn serve_session(connection: Connection, tx: mpsc::Sender<TargetedStream>) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let mut stream = QuicStream::new(send, recv, connection.clone());
                match TargetAddr::read_from(&mut stream).await {
                    Ok(target) => {
                        let accepted = TargetedStream {
                            stream: TransportStream::Quic(stream),
                            target,
                        };
                        if tx.send(accepted).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => debug!(%err, "bad target header on QUIC stream"),
                }
            }
            Err(err) => {
                debug!(%err, "QUIC session closed");
                return;
            }
        }
    }
}

/// Host part of a `host:port` endpoint, for SNI
fn sni_host(relay: &str) -> &str {
    let host = relay.rsplit_once(':').map_or(relay, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn client_config() -> Result<quinn::ClientConfig, TransportError> {
    let mut tls = insecure::client_config();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Session(format!("crypto config: {e}")))?;

    let mut transport = quinn::TransportConfig::default();
    let idle = IDLE_TIMEOUT
        .try_into()
        .map_err(|_| TransportError::Session("invalid idle timeout".into()))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Server config with a per-process self-signed throwaway certificate
fn server_config() -> Result<quinn::ServerConfig, TransportError> {
    insecure::ensure_crypto_provider();
    let cert = rcgen::generate_simple_self_signed(vec!["divert".to_string()])
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_INCOMING_STREAMS));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stable_id_of(stream: &TransportStream) -> usize {
        match stream {
            TransportStream::Quic(s) => s.stable_id(),
            other => panic!("expected QUIC stream, got {other:?}"),
        }
    }

    #[test]
    fn test_sni_host() {
        assert_eq!(sni_host("relay.example:8443"), "relay.example");
        assert_eq!(sni_host("127.0.0.1:8443"), "127.0.0.1");
        assert_eq!(sni_host("[::1]:8443"), "::1");
    }

    #[test]
    fn test_config_builders() {
        assert!(client_config().is_ok());
        assert!(server_config().is_ok());
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let transport = QuicTransport::new();
        let mut incoming = transport.listen("127.0.0.1:0").await.unwrap();
        let relay = incoming.local_addr().to_string();

        let target = TargetAddr::new("example.com", 443);
        let mut stream = transport.dial(&relay, &target).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let mut accepted = incoming.next().await.unwrap();
        assert_eq!(accepted.target, target);

        let mut payload = [0u8; 5];
        accepted.stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");

        accepted.stream.write_all(b"world").await.unwrap();
        accepted.stream.flush().await.unwrap();

        let mut echo = [0u8; 5];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"world");
    }

    #[tokio::test]
    async fn test_session_reused_across_dials() {
        let transport = QuicTransport::new();
        let mut incoming = transport.listen("127.0.0.1:0").await.unwrap();
        let relay = incoming.local_addr().to_string();

        let first = transport
            .dial(&relay, &TargetAddr::new("a.example", 80))
            .await
            .unwrap();
        let accepted_first = incoming.next().await.unwrap();
        assert_eq!(accepted_first.target.host, "a.example");

        let second = transport
            .dial(&relay, &TargetAddr::new("b.example", 443))
            .await
            .unwrap();
        let accepted_second = incoming.next().await.unwrap();
        assert_eq!(accepted_second.target.host, "b.example");

        // Both client streams are multiplexed onto the one cached session
        assert_eq!(stable_id_of(&first), stable_id_of(&second));
    }

    #[tokio::test]
    async fn test_dial_unreachable() {
        let transport = QuicTransport::new();
        // Nothing listens here; the handshake deadline bounds the failure
        let err = transport
            .dial("127.0.0.1:1", &TargetAddr::new("example.com", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Session(_)));
    }
}
