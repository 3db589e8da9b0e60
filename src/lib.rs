//! divert: client-side core of a transparent traffic-forwarding tool
//!
//! divert answers DNS on a local address and decides, per domain, whether
//! the query resolves to the local interceptor (so the subsequent TCP/TLS
//! flow gets tunnelled) or is forwarded untouched to the upstream recursive
//! resolver. A background probe engine compares direct reachability against
//! reachability through the interceptor and suggests new domains for
//! interception.
//!
//! # Architecture
//!
//! ```text
//! DNS query → dispatcher → rule triple (white / block / suggest)
//!                │                │
//!                │ unmatched      │ matched
//!                ▼                ▼
//!        forward upstream    synthesize A/AAAA → listener IP
//!                │
//!                └─ background: single-flight probe → suggestion callback
//! ```
//!
//! Downstream of interception, tunnelled flows ride a pluggable transport:
//! each dialled stream starts with a framed target address, then raw
//! payload. See [`transport`].
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`dns`]: DNS server, upstream forwarding, resolver discovery
//! - [`error`]: Error types
//! - [`rules`]: Suffix-trie rule matching and atomic rule publication
//! - [`suggest`]: Probe engine and single-flight memoization
//! - [`transport`]: QUIC, KCP and SOCKS5 tunnel transports

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod dns;
pub mod error;
pub mod rules;
pub mod suggest;
pub mod transport;

// Re-export commonly used types at the crate root
pub use config::{load_config, Config, TransportKind};
pub use dns::{
    discovery_channel, DefaultDnsSource, DiscoveryTask, DnsError, DnsServer, DnsResult, Forwarder,
    QueryHandler, ResolvConf, Upstream, LOCAL_TTL,
};
pub use error::{ConfigError, DivertError, RuleError};
pub use rules::{Classification, DomainTrie, RuleSet, SharedRules, MAX_RULES};
pub use suggest::{ProbeCache, ProbeEngine, Prober, SuggestFn, SuggestLevel};
pub use transport::{
    Incoming, KcpTransport, QuicTransport, Socks5Transport, TargetAddr, TargetedStream, Transport,
    TransportError, TransportStream,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
