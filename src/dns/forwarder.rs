//! Upstream DNS forwarding
//!
//! One UDP exchange per query with a tight deadline. The dispatcher handles
//! a forwarding failure by not answering at all (the client retries by
//! protocol) and by kicking the discovery task.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::error::{DnsError, DnsResult};

/// Deadline for a full upstream exchange
pub const FORWARD_TIMEOUT: Duration = Duration::from_millis(200);

/// Receive buffer; large enough for EDNS0 responses
const RECV_BUFFER_SIZE: usize = 4096;

/// Stateless upstream DNS client
///
/// Each call binds a fresh ephemeral socket, sends the query and waits for
/// one datagram from the queried upstream.
#[derive(Debug, Clone)]
pub struct Forwarder {
    timeout: Duration,
}

impl Forwarder {
    /// Create a forwarder with the standard 200 ms deadline
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: FORWARD_TIMEOUT,
        }
    }

    /// Create a forwarder with a custom deadline
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Exchange `query` with `upstream`
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Timeout`] when the deadline passes,
    /// [`DnsError::EmptyResponse`] for a zero-length reply, and
    /// [`DnsError::UnexpectedSource`] when the reply does not come from the
    /// queried upstream.
    pub async fn forward(&self, query: &Message, upstream: SocketAddr) -> DnsResult<Message> {
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::Serialize(e.to_string()))?;

        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
        } else {
            (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(&query_bytes, upstream).await?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, src) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout {
                upstream,
                timeout: self.timeout,
            })??;

        if src != upstream {
            return Err(DnsError::UnexpectedSource {
                expected: upstream,
                actual: src,
            });
        }
        if len == 0 {
            return Err(DnsError::EmptyResponse { upstream });
        }

        Message::from_vec(&buf[..len]).map_err(|e| DnsError::Parse(e.to_string()))
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Header, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn query_for(domain: &str, id: u16) -> Message {
        let mut message = Message::new();
        message.set_id(id);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message
    }

    /// A one-shot fake resolver on an ephemeral loopback port
    async fn spawn_upstream(answer_ip: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();

            let mut response = Message::new();
            response.set_header(Header::response_from_request(query.header()));
            for q in query.queries() {
                response.add_query(q.clone());
            }
            response.add_answer(Record::from_rdata(
                query.queries()[0].name().clone(),
                300,
                RData::A(A(answer_ip)),
            ));
            socket
                .send_to(&response.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let upstream = spawn_upstream(Ipv4Addr::new(9, 9, 9, 9)).await;
        let forwarder = Forwarder::new();

        let response = forwarder
            .forward(&query_for("example.com.", 0x4242), upstream)
            .await
            .unwrap();

        assert_eq!(response.id(), 0x4242);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_timeout() {
        // Bind an upstream that never answers
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = socket.local_addr().unwrap();

        let forwarder = Forwarder::with_timeout(Duration::from_millis(50));
        let err = forwarder
            .forward(&query_for("example.com.", 1), upstream)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.triggers_discovery());
    }

    #[tokio::test]
    async fn test_forward_empty_response() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&[], peer).await.unwrap();
        });

        let forwarder = Forwarder::new();
        let err = forwarder
            .forward(&query_for("example.com.", 2), upstream)
            .await
            .unwrap_err();

        assert!(matches!(err, DnsError::EmptyResponse { .. }));
        assert!(!err.triggers_discovery());
    }
}
