//! Scored reachability probing
//!
//! A probe run launches four concurrent reachability tests for a domain:
//! HTTP and HTTPS, each via the domain's resolved address ("direct") and via
//! the local interceptor address. Outcomes are folded into a [`Scoreboard`]
//! in completion order; when the score reaches the probe count, the
//! suggestion callback fires exactly once.
//!
//! Scoring:
//!
//! - direct probe failed: `+1` (the direct path is broken)
//! - interceptor probe failed: `-1` (the tunnel path is broken; not a
//!   candidate)
//! - interceptor probe answered first for its protocol: `+1` in SPEEDUP mode
//! - direct probe answered first for its protocol: the race is lost, no
//!   score change and no threshold check
//!
//! HTTPS probes send a real ClientHello with SNI set to the candidate
//! domain; certificate verification is off, reachability is all that is
//! measured.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::cache::Prober;
use super::SuggestLevel;
use crate::transport::insecure;

/// Callback invoked with a domain when a suggestion fires
pub type SuggestFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Number of concurrent probes per run, and the suggestion threshold
const PROBE_COUNT: i32 = 4;

/// Deadline for a single connect + handshake
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Anti-loop guard against wildcard DNS: refuse names with more dots
const MAX_DOTS: usize = 10;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Via {
    Direct,
    Interceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Http = 0,
    Https = 1,
}

#[derive(Debug, Clone, Copy)]
struct ProbeOutcome {
    via: Via,
    proto: Proto,
    reachable: bool,
}

/// Which side answered a protocol slot first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotWinner {
    Open,
    Interceptor,
    Direct,
}

/// Pure fold over probe outcomes in arrival order
struct Scoreboard {
    level: SuggestLevel,
    score: i32,
    slots: [SlotWinner; 2],
    fired: bool,
}

impl Scoreboard {
    fn new(level: SuggestLevel) -> Self {
        Self {
            level,
            score: 0,
            slots: [SlotWinner::Open; 2],
            fired: false,
        }
    }

    /// Apply one outcome; returns true when this outcome crossed the
    /// suggestion threshold (at most once per board).
    fn apply(&mut self, outcome: ProbeOutcome) -> bool {
        let slot = &mut self.slots[outcome.proto as usize];
        match (outcome.reachable, outcome.via) {
            (false, Via::Direct) => self.score += 1,
            (false, Via::Interceptor) => self.score -= 1,
            (true, Via::Interceptor) => {
                if *slot == SlotWinner::Open {
                    *slot = SlotWinner::Interceptor;
                    if self.level == SuggestLevel::Speedup {
                        self.score += 1;
                    }
                }
            }
            (true, Via::Direct) => {
                if *slot == SlotWinner::Open {
                    *slot = SlotWinner::Direct;
                }
                // Direct won the race for this protocol; nothing to re-check
                return false;
            }
        }

        if !self.fired && self.score >= PROBE_COUNT {
            self.fired = true;
            self.score = -1;
            return true;
        }
        false
    }
}

/// The probe engine
///
/// One engine instance serves the whole process; per-domain state lives on
/// the stack of a single [`Prober::probe_one`] call.
pub struct ProbeEngine {
    listen_ip: IpAddr,
    level: SuggestLevel,
    timeout: Duration,
    http_port: u16,
    https_port: u16,
    suggest_fn: SuggestFn,
}

impl ProbeEngine {
    /// Create an engine probing via the given interceptor address
    #[must_use]
    pub fn new(listen_ip: IpAddr, level: SuggestLevel, suggest_fn: SuggestFn) -> Self {
        Self {
            listen_ip,
            level,
            timeout: PROBE_TIMEOUT,
            http_port: HTTP_PORT,
            https_port: HTTPS_PORT,
            suggest_fn,
        }
    }

    /// Override the probed ports (loopback tests)
    #[must_use]
    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    async fn run_probes(&self, domain: &str, direct_ip: IpAddr) {
        let (tx, mut rx) = mpsc::channel(PROBE_COUNT as usize);

        let matrix = [
            (Via::Direct, Proto::Http, direct_ip, self.http_port),
            (Via::Interceptor, Proto::Http, self.listen_ip, self.http_port),
            (Via::Direct, Proto::Https, direct_ip, self.https_port),
            (Via::Interceptor, Proto::Https, self.listen_ip, self.https_port),
        ];

        for (via, proto, ip, port) in matrix {
            let tx = tx.clone();
            let domain = domain.to_string();
            let deadline = self.timeout;
            tokio::spawn(async move {
                let reachable = match proto {
                    Proto::Http => http_ping(ip, port, &domain, deadline).await,
                    Proto::Https => https_ping(ip, port, &domain, deadline).await,
                };
                let _ = tx
                    .send(ProbeOutcome {
                        via,
                        proto,
                        reachable,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut board = Scoreboard::new(self.level);
        while let Some(outcome) = rx.recv().await {
            debug!(domain, ?outcome, "probe outcome");
            if board.apply(outcome) {
                info!(domain, "suggesting interception");
                (self.suggest_fn)(domain);
            }
        }
    }
}

#[async_trait]
impl Prober for ProbeEngine {
    async fn probe_one(&self, domain: &str) {
        if self.level == SuggestLevel::Disable {
            return;
        }

        let domain = domain.trim_end_matches('.');
        if domain.is_empty() || domain.matches('.').count() > MAX_DOTS {
            return;
        }

        let direct_ip = match tokio::net::lookup_host((domain, HTTP_PORT)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr.ip(),
                None => {
                    debug!(domain, "no addresses resolved, skipping probe");
                    return;
                }
            },
            Err(err) => {
                debug!(domain, %err, "resolution failed, skipping probe");
                return;
            }
        };

        self.run_probes(domain, direct_ip).await;
    }
}

impl std::fmt::Debug for ProbeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeEngine")
            .field("listen_ip", &self.listen_ip)
            .field("level", &self.level)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// TCP connect plus a HEAD exchange, bounded by `deadline`
async fn http_ping(ip: IpAddr, port: u16, domain: &str, deadline: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect(SocketAddr::new(ip, port)).await?;
        let request = format!("HEAD / HTTP/1.1\r\nHost: {domain}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut first = [0u8; 1];
        if stream.read(&mut first).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok::<(), io::Error>(())
    };

    matches!(timeout(deadline, attempt).await, Ok(Ok(())))
}

/// TCP connect plus a TLS ClientHello with SNI = `domain`, bounded by
/// `deadline`; the handshake completing is the reachability signal
async fn https_ping(ip: IpAddr, port: u16, domain: &str, deadline: Duration) -> bool {
    let Ok(server_name) = ServerName::try_from(domain.to_string()) else {
        return false;
    };

    let attempt = async {
        let stream = TcpStream::connect(SocketAddr::new(ip, port)).await?;
        probe_connector().connect(server_name, stream).await?;
        Ok::<(), io::Error>(())
    };

    matches!(timeout(deadline, attempt).await, Ok(Ok(())))
}

fn probe_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| Arc::new(insecure::client_config()));
    TlsConnector::from(Arc::clone(config))
}
