//! DNS interception engine
//!
//! A UDP DNS server that classifies each query against the rule triple:
//! whitelisted domains are forwarded to the upstream resolver, blocked and
//! suggested domains get a synthesized answer pointing at the local
//! interceptor, and everything else is forwarded while a background probe
//! decides whether to suggest it.
//!
//! The upstream resolver address is discovered and re-discovered on demand
//! by [`discovery::DiscoveryTask`] whenever forwarding starts failing.

pub mod discovery;
mod error;
pub mod forwarder;
pub mod server;

pub use discovery::{discovery_channel, DefaultDnsSource, DiscoveryTask, ResolvConf, Upstream};
pub use error::{DnsError, DnsResult};
pub use forwarder::Forwarder;
pub use server::{DnsServer, QueryHandler, LOCAL_TTL};
