//! DNS server and query dispatcher
//!
//! The server owns the UDP socket and spawns one task per query so slow
//! upstream exchanges never stall the receive loop. The dispatcher itself
//! lives in [`QueryHandler`], which is socket-free and directly testable.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Header, Message};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, trace};

use super::error::{DnsError, DnsResult};
use super::forwarder::Forwarder;
use super::discovery::Upstream;
use crate::rules::{Classification, SharedRules};
use crate::suggest::ProbeCache;

/// TTL for synthesized interception answers
pub const LOCAL_TTL: u32 = 20;

/// Per-query dispatcher
///
/// Classifies the query domain against the rule triple, synthesizes a local
/// answer for intercepted domains, forwards everything else and hands
/// unmatched domains to the probe cache in the background.
pub struct QueryHandler {
    listen_ip: IpAddr,
    rules: Arc<SharedRules>,
    upstream: Arc<Upstream>,
    forwarder: Forwarder,
    trigger: mpsc::Sender<()>,
    probes: Arc<ProbeCache>,
}

impl QueryHandler {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        listen_ip: IpAddr,
        rules: Arc<SharedRules>,
        upstream: Arc<Upstream>,
        trigger: mpsc::Sender<()>,
        probes: Arc<ProbeCache>,
    ) -> Self {
        Self {
            listen_ip,
            rules,
            upstream,
            forwarder: Forwarder::new(),
            trigger,
            probes,
        }
    }

    /// Handle one query; `None` means no response is written
    pub async fn handle(&self, query: Message) -> Option<Message> {
        // A signed query keeps its transaction signature on the way back
        let tsig = take_tsig(&query);

        // An empty question section is simply dropped
        let question = query.queries().first()?;
        let name = question.name().to_utf8();
        // A stray port suffix in the question name is stripped defensively
        let domain = match name.split_once(':') {
            Some((host, _)) => host,
            None => name.as_str(),
        };

        let mut response = match self.rules.snapshot().classify(domain) {
            Classification::Whitelisted => {
                trace!(domain, "whitelisted, forwarding");
                self.forward(&query).await?
            }
            Classification::Intercept => {
                debug!(domain, "intercepting");
                local_answer(&query, self.listen_ip)
            }
            Classification::Unmatched => {
                let probes = Arc::clone(&self.probes);
                let candidate = domain.to_string();
                tokio::spawn(async move {
                    probes.remember(&candidate).await;
                });
                self.forward(&query).await?
            }
        };

        if let Some(tsig) = tsig {
            response.add_additional(tsig);
        }
        Some(response)
    }

    async fn forward(&self, query: &Message) -> Option<Message> {
        let upstream = self.upstream.get();
        match self.forwarder.forward(query, upstream).await {
            Ok(response) => Some(response),
            Err(err) => {
                if err.triggers_discovery() {
                    // Non-blocking: drop the signal if a round is pending
                    let _ = self.trigger.try_send(());
                }
                debug!(%upstream, %err, "upstream exchange failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for QueryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandler")
            .field("listen_ip", &self.listen_ip)
            .field("upstream", &self.upstream.get())
            .finish()
    }
}

/// Synthesize the interception answer for a query
///
/// The single answer record points at the listener: an A record when the
/// listener is IPv4, an AAAA record otherwise, with [`LOCAL_TTL`].
fn local_answer(query: &Message, listen_ip: IpAddr) -> Message {
    let mut response = Message::new();
    response.set_header(Header::response_from_request(query.header()));
    for q in query.queries() {
        response.add_query(q.clone());
    }

    let name = query.queries()[0].name().clone();
    let rdata = match listen_ip {
        IpAddr::V4(ip) => RData::A(A(ip)),
        IpAddr::V6(ip) => RData::AAAA(AAAA(ip)),
    };
    let mut record = Record::from_rdata(name, LOCAL_TTL, rdata);
    record.set_dns_class(DNSClass::IN);
    response.add_answer(record);
    response
}

/// Pull a trailing TSIG record out of the query's additionals, if any
fn take_tsig(query: &Message) -> Option<Record> {
    query
        .additionals()
        .last()
        .filter(|record| record.record_type() == RecordType::TSIG)
        .cloned()
}

/// UDP DNS server
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
}

impl DnsServer {
    /// Bind the listener socket
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Bind`] when the address is unavailable; the
    /// caller treats this as fatal.
    pub async fn bind(addr: SocketAddr, handler: Arc<QueryHandler>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DnsError::Bind { addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            handler,
        })
    }

    /// Local address of the listener
    ///
    /// # Errors
    ///
    /// Propagates the socket's own address lookup failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the receive loop
    ///
    /// Each query is served on its own task. Transient receive errors are
    /// retried after a short pause; anything else tears the listener down
    /// and is surfaced to the caller, which exits non-zero.
    pub async fn run(self) -> DnsResult<()> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    if let Err(fatal) = check_recv_error(err) {
                        error!(%fatal, "unrecoverable DNS listener error");
                        return Err(fatal);
                    }
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let query = match Message::from_vec(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    debug!(%peer, %err, "malformed DNS query");
                    continue;
                }
            };

            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                let Some(response) = handler.handle(query).await else {
                    return;
                };
                match response.to_vec() {
                    Ok(bytes) => {
                        if let Err(err) = socket.send_to(&bytes, peer).await {
                            debug!(%peer, %err, "DNS send error");
                        }
                    }
                    Err(err) => error!(%err, "DNS response encode error"),
                }
            });
        }
    }
}

/// Decide whether the receive loop survives a socket error
///
/// Interrupts and ICMP blowback from clients that went away are retried;
/// anything else is fatal for the listener.
fn check_recv_error(err: io::Error) -> DnsResult<()> {
    match err.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused => {
            debug!(%err, "transient DNS recv error");
            Ok(())
        }
        _ => Err(DnsError::Listener(err)),
    }
}
