//! Upstream resolver discovery
//!
//! The forwarder signals this task whenever an exchange fails. On each
//! trigger the task first probes the current upstream with a cheap
//! non-recursive reverse lookup; only if that also fails does it consult the
//! platform default-DNS source and atomically publish the new address.
//!
//! The trigger channel holds a single slot and producers drop on full, so
//! there is never more than one outstanding discovery request and a burst of
//! failing queries cannot cause a retry storm.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::forwarder::Forwarder;

/// Well-known DNS port for discovered upstreams
pub const DNS_PORT: u16 = 53;

/// Atomically published upstream resolver address
///
/// Many readers (one per in-flight query), one writer (the discovery task).
/// Readers observe either the old or the new address, never a torn value.
#[derive(Debug)]
pub struct Upstream {
    addr: ArcSwap<SocketAddr>,
}

impl Upstream {
    /// Create with an initial address
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: ArcSwap::from_pointee(addr),
        }
    }

    /// Current upstream address
    #[must_use]
    pub fn get(&self) -> SocketAddr {
        **self.addr.load()
    }

    /// Publish a new address
    pub fn set(&self, addr: SocketAddr) {
        self.addr.store(Arc::new(addr));
    }
}

/// Create the discovery trigger channel
///
/// Capacity one: the producer side uses `try_send` and drops the signal if
/// a discovery round is already pending.
#[must_use]
pub fn discovery_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// Platform source for the default recursive resolver
///
/// OS-specific; production uses [`ResolvConf`], tests inject stubs.
pub trait DefaultDnsSource: Send + Sync {
    /// Find the system default DNS server
    ///
    /// # Errors
    ///
    /// Returns an error when no resolver can be determined.
    fn default_dns(&self) -> io::Result<IpAddr>;
}

/// Default-DNS source backed by `/etc/resolv.conf`
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvConf;

impl ResolvConf {
    const PATH: &'static str = "/etc/resolv.conf";

    fn parse(contents: &str) -> Option<IpAddr> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
            .filter_map(|line| line.strip_prefix("nameserver"))
            .filter_map(|rest| rest.trim().parse().ok())
            .next()
    }
}

impl DefaultDnsSource for ResolvConf {
    fn default_dns(&self) -> io::Result<IpAddr> {
        let contents = std::fs::read_to_string(Self::PATH)?;
        Self::parse(&contents).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no nameserver entry in {}", Self::PATH),
            )
        })
    }
}

/// The long-lived discovery task
pub struct DiscoveryTask {
    listen_ip: IpAddr,
    upstream: Arc<Upstream>,
    source: Arc<dyn DefaultDnsSource>,
    forwarder: Forwarder,
    trigger: mpsc::Receiver<()>,
}

impl DiscoveryTask {
    /// Create a discovery task draining `trigger`
    #[must_use]
    pub fn new(
        listen_ip: IpAddr,
        upstream: Arc<Upstream>,
        source: Arc<dyn DefaultDnsSource>,
        trigger: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            listen_ip,
            upstream,
            source,
            forwarder: Forwarder::new(),
            trigger,
        }
    }

    /// Run until the trigger channel closes
    pub async fn run(mut self) {
        while self.trigger.recv().await.is_some() {
            self.rediscover().await;
        }
    }

    async fn rediscover(&self) {
        let current = self.upstream.get();
        if self
            .forwarder
            .forward(&reverse_probe(self.listen_ip), current)
            .await
            .is_ok()
        {
            debug!(upstream = %current, "current upstream still answering");
            return;
        }

        match self.source.default_dns() {
            Ok(host) => {
                let addr = SocketAddr::new(host, DNS_PORT);
                self.upstream.set(addr);
                info!(upstream = %addr, "switched upstream resolver");
            }
            Err(err) => {
                // Wait for the next trigger; no retry loop here
                warn!(%err, "default DNS discovery failed");
            }
        }
    }
}

/// A minimal liveness probe: non-recursive PTR for the listener address
fn reverse_probe(listen_ip: IpAddr) -> Message {
    let reverse_name = match listen_ip {
        IpAddr::V4(ip) => Name::from(ip),
        IpAddr::V6(ip) => Name::from(ip),
    };
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_recursion_desired(false);
    message.add_query(Query::query(reverse_name, RecordType::PTR));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Header;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    struct StubSource {
        answer: IpAddr,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(answer: IpAddr) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl DefaultDnsSource for StubSource {
        fn default_dns(&self) -> io::Result<IpAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct FailingSource;

    impl DefaultDnsSource for FailingSource {
        fn default_dns(&self) -> io::Result<IpAddr> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    /// An upstream that answers every PTR probe it receives
    async fn spawn_live_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                if let Ok(query) = Message::from_vec(&buf[..len]) {
                    let mut response = Message::new();
                    response.set_header(Header::response_from_request(query.header()));
                    for q in query.queries() {
                        response.add_query(q.clone());
                    }
                    let _ = socket.send_to(&response.to_vec().unwrap(), peer).await;
                }
            }
        });
        addr
    }

    fn listen_ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_resolv_conf_parse() {
        let contents = "# generated\n;options\nsearch lan\nnameserver 192.168.1.1\nnameserver 1.1.1.1\n";
        assert_eq!(
            ResolvConf::parse(contents),
            Some("192.168.1.1".parse().unwrap())
        );
        assert_eq!(ResolvConf::parse("search lan\n"), None);
    }

    #[test]
    fn test_upstream_swap() {
        let upstream = Upstream::new("1.1.1.1:53".parse().unwrap());
        assert_eq!(upstream.get(), "1.1.1.1:53".parse().unwrap());
        upstream.set("9.9.9.9:53".parse().unwrap());
        assert_eq!(upstream.get(), "9.9.9.9:53".parse().unwrap());
    }

    #[test]
    fn test_trigger_channel_drops_on_full() {
        let (tx, mut rx) = discovery_channel();
        assert!(tx.try_send(()).is_ok());
        // Slot taken: further triggers are dropped, not queued
        assert!(tx.try_send(()).is_err());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_upstream_publishes_discovered_address() {
        // Current upstream: a socket nobody answers on
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = Arc::new(Upstream::new(dead.local_addr().unwrap()));
        let source = StubSource::new("10.0.0.53".parse().unwrap());

        let (tx, rx) = discovery_channel();
        let task = DiscoveryTask {
            listen_ip: listen_ip(),
            upstream: Arc::clone(&upstream),
            source: Arc::clone(&source) as Arc<dyn DefaultDnsSource>,
            forwarder: Forwarder::with_timeout(std::time::Duration::from_millis(50)),
            trigger: rx,
        };
        let handle = tokio::spawn(task.run());

        tx.send(()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(upstream.get(), "10.0.0.53:53".parse().unwrap());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_live_upstream_left_alone() {
        let live = spawn_live_upstream().await;
        let upstream = Arc::new(Upstream::new(live));
        let source = StubSource::new("10.0.0.53".parse().unwrap());

        let (tx, rx) = discovery_channel();
        let task = DiscoveryTask::new(
            listen_ip(),
            Arc::clone(&upstream),
            Arc::clone(&source) as Arc<dyn DefaultDnsSource>,
            rx,
        );
        let handle = tokio::spawn(task.run());

        tx.send(()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // Probe succeeded: address unchanged, OS source never consulted
        assert_eq!(upstream.get(), live);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_discovery_keeps_address() {
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let initial = dead.local_addr().unwrap();
        let upstream = Arc::new(Upstream::new(initial));

        let (tx, rx) = discovery_channel();
        let task = DiscoveryTask {
            listen_ip: listen_ip(),
            upstream: Arc::clone(&upstream),
            source: Arc::new(FailingSource),
            forwarder: Forwarder::with_timeout(std::time::Duration::from_millis(50)),
            trigger: rx,
        };
        let handle = tokio::spawn(task.run());

        tx.send(()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(upstream.get(), initial);
    }
}
