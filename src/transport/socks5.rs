//! SOCKS5 client transport (RFC 1928)
//!
//! Dialling only opens the TCP connection; the SOCKS5 negotiation is
//! deferred to the first write, so a dialled stream costs nothing until
//! payload actually flows. The stream is a small state machine:
//!
//! ```text
//! Fresh --first write--> Handshaking --ok--> Ready
//!                              |
//!                              +--error--> Failed
//! ```
//!
//! Reads park until the state leaves `Handshaking`; once `Ready`, reads and
//! writes pass straight through to the TCP stream. The CONNECT request
//! always uses ATYP=DOMAINNAME with the caller's `host:port`, and the
//! server's bound address in the reply is consumed and discarded.
//!
//! Listening is not supported; this transport is client-only.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use super::addr::TargetAddr;
use super::error::TransportError;
use super::{resolve, Incoming, Transport, TransportStream};

/// SOCKS5 protocol version
const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
const AUTH_METHOD_NONE: u8 = 0x00;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// Address types in replies
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Success reply code
const REPLY_SUCCEEDED: u8 = 0x00;

/// SOCKS5 tunnel transport (client only)
#[derive(Debug, Clone, Copy, Default)]
pub struct Socks5Transport;

impl Socks5Transport {
    /// Create the transport
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for Socks5Transport {
    async fn dial(
        &self,
        relay: &str,
        target: &TargetAddr,
    ) -> Result<TransportStream, TransportError> {
        if target.host.is_empty() || target.host.len() > u8::MAX as usize {
            return Err(TransportError::InvalidTarget(target.to_string()));
        }

        let relay_addr = resolve(relay).await?;
        let stream = TcpStream::connect(relay_addr)
            .await
            .map_err(|e| TransportError::Dial {
                addr: relay.to_string(),
                reason: e.to_string(),
            })?;

        Ok(TransportStream::Socks5(Socks5Stream::new(
            stream,
            target.clone(),
        )))
    }

    async fn listen(&self, _addr: &str) -> Result<Incoming, TransportError> {
        Err(TransportError::ListenUnsupported)
    }
}

type HandshakeFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum State {
    Fresh(TcpStream),
    Handshaking(HandshakeFuture),
    Ready(TcpStream),
    Failed,
}

/// A TCP stream whose SOCKS5 negotiation runs on the first write
pub struct Socks5Stream {
    state: State,
    target: TargetAddr,
    read_wakers: Vec<Waker>,
}

impl Socks5Stream {
    pub(crate) fn new(stream: TcpStream, target: TargetAddr) -> Self {
        Self {
            state: State::Fresh(stream),
            target,
            read_wakers: Vec::new(),
        }
    }

    fn wake_readers(&mut self) {
        for waker in self.read_wakers.drain(..) {
            waker.wake();
        }
    }

    fn park_reader(&mut self, cx: &Context<'_>) {
        if !self.read_wakers.iter().any(|w| w.will_wake(cx.waker())) {
            self.read_wakers.push(cx.waker().clone());
        }
    }

    /// Drive an in-flight handshake; `Ready(Ok)` means the state is now
    /// `Ready` or `Failed`, and parked readers have been woken.
    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let State::Handshaking(fut) = &mut self.state else {
            return Poll::Ready(Ok(()));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(stream)) => {
                self.state = State::Ready(stream);
                self.wake_readers();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                self.state = State::Failed;
                self.wake_readers();
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Socks5Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Ready(stream) => return Pin::new(stream).poll_write(cx, buf),
                State::Failed => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "SOCKS5 handshake previously failed",
                    )))
                }
                State::Fresh(_) => {
                    let State::Fresh(stream) = std::mem::replace(&mut this.state, State::Failed)
                    else {
                        unreachable!()
                    };
                    trace!(dst = %this.target, "starting SOCKS5 handshake");
                    this.state = State::Handshaking(Box::pin(handshake(stream, this.target.clone())));
                }
                State::Handshaking(_) => match this.poll_handshake(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(stream) | State::Fresh(stream) => Pin::new(stream).poll_flush(cx),
            State::Failed => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            State::Handshaking(_) => match this.poll_handshake(cx) {
                Poll::Ready(Ok(())) => match &mut this.state {
                    State::Ready(stream) => Pin::new(stream).poll_flush(cx),
                    _ => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                },
                Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(stream) | State::Fresh(stream) => Pin::new(stream).poll_shutdown(cx),
            // Nothing left to shut down
            State::Failed => Poll::Ready(Ok(())),
            State::Handshaking(_) => match this.poll_handshake(cx) {
                Poll::Ready(Ok(())) => match &mut this.state {
                    State::Ready(stream) => Pin::new(stream).poll_shutdown(cx),
                    _ => Poll::Ready(Ok(())),
                },
                Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncRead for Socks5Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(stream) => Pin::new(stream).poll_read(cx, buf),
            State::Failed => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "SOCKS5 handshake previously failed",
            ))),
            // Reads wait for the first write to complete the negotiation
            State::Fresh(_) | State::Handshaking(_) => {
                this.park_reader(cx);
                Poll::Pending
            }
        }
    }
}

impl std::fmt::Debug for Socks5Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Fresh(_) => "fresh",
            State::Handshaking(_) => "handshaking",
            State::Ready(_) => "ready",
            State::Failed => "failed",
        };
        f.debug_struct("Socks5Stream")
            .field("state", &state)
            .field("target", &self.target)
            .finish()
    }
}

/// Full SOCKS5 negotiation: method selection, CONNECT, reply consumption
async fn handshake(mut stream: TcpStream, target: TargetAddr) -> io::Result<TcpStream> {
    // Method selection: we only ever offer "no authentication"
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
        .await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "unexpected SOCKS version {:#04x}",
            selection[0]
        )));
    }
    if selection[1] != AUTH_METHOD_NONE {
        return Err(protocol_error(format!(
            "server requires unsupported auth method {:#04x}",
            selection[1]
        )));
    }

    // CONNECT with ATYP=DOMAINNAME; the relay resolves the host itself
    let host = target.host.as_bytes();
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[
        SOCKS5_VERSION,
        CMD_CONNECT,
        0x00,
        ATYP_DOMAIN,
        host.len() as u8,
    ]);
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply header: VER REP RSV ATYP
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "unexpected SOCKS version {:#04x} in reply",
            reply[0]
        )));
    }
    if reply[1] != REPLY_SUCCEEDED {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            TransportError::Socks5Reply { code: reply[1] },
        ));
    }

    // Consume the bound address; its value is of no use to the tunnel
    match reply[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
        }
        other => {
            return Err(protocol_error(format!(
                "unknown address type {other:#04x} in reply"
            )))
        }
    }
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(stream)
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
