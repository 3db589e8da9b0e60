//! divert: client-side core of a transparent traffic-forwarding tool
//!
//! This binary runs the DNS interception engine: it binds UDP/53 on the
//! configured listener address, classifies queries against the rule triple
//! and runs the adaptive suggestion prober in the background.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./divert
//!
//! # Run with custom configuration
//! sudo ./divert -c /path/to/config.json
//!
//! # Check a configuration without starting
//! ./divert -c /path/to/config.json --check
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use divert::config::{load_config, Config};
use divert::dns::{
    discovery_channel, DefaultDnsSource, DiscoveryTask, DnsServer, QueryHandler, ResolvConf,
    Upstream,
};
use divert::rules::SharedRules;
use divert::suggest::{ProbeCache, ProbeEngine, SuggestFn};

/// Well-known DNS port
const DNS_PORT: u16 = 53;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/divert/config.json");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("divert v{}", divert::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"divert v{}

Transparent traffic-forwarding client: DNS interception with adaptive
suggestions.

USAGE:
    divert [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file path [default: /etc/divert/config.json]
    --check                Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

REQUIREMENTS:
    - Binding UDP/53 needs CAP_NET_BIND_SERVICE (or root)
"#,
        divert::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the config file level.
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        // Reduce noise from dependencies
        .add_directive("quinn=warn".parse().expect("static directive"))
        .add_directive("rustls=warn".parse().expect("static directive"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick the initial upstream resolver address
///
/// An empty `dnsServer` means "discover": consult the platform source now
/// and let the discovery loop correct it later. A configured value may be
/// `ip` (port 53 implied) or `ip:port`.
fn initial_upstream(config: &Config, source: &dyn DefaultDnsSource) -> SocketAddr {
    let fallback = SocketAddr::new(std::net::IpAddr::from([1, 1, 1, 1]), DNS_PORT);

    if config.dns_server.is_empty() {
        return match source.default_dns() {
            Ok(host) => SocketAddr::new(host, DNS_PORT),
            Err(err) => {
                warn!(%err, "no default resolver found, starting with a public one");
                fallback
            }
        };
    }
    if let Ok(addr) = config.dns_server.parse::<SocketAddr>() {
        return addr;
    }
    match config.dns_server.parse::<std::net::IpAddr>() {
        Ok(host) => SocketAddr::new(host, DNS_PORT),
        Err(err) => {
            warn!(%err, server = %config.dns_server, "unparseable dnsServer, starting with a public one");
            fallback
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        println!("configuration OK: {}", args.config_path.display());
        return Ok(());
    }

    init_logging(&config);
    info!(version = divert::VERSION, listen_ip = %config.listen_ip, "starting divert");

    let level = config.suggest_level()?;
    let source: Arc<dyn DefaultDnsSource> = Arc::new(ResolvConf);

    let rules = Arc::new(SharedRules::from_config(&config)?);
    let upstream = Arc::new(Upstream::new(initial_upstream(&config, source.as_ref())));
    info!(upstream = %upstream.get(), "upstream resolver");

    // Discovery loop: kicked by forwarding failures, and once at startup
    // when no upstream was configured
    let (trigger, trigger_rx) = discovery_channel();
    let discovery = DiscoveryTask::new(
        config.listen_ip,
        Arc::clone(&upstream),
        Arc::clone(&source),
        trigger_rx,
    );
    tokio::spawn(discovery.run());
    if config.dns_server.is_empty() {
        let _ = trigger.try_send(());
    }

    // Suggestions append to the live rule set; persisting them is the
    // host's side of the contract
    let suggest_fn: SuggestFn = {
        let rules = Arc::clone(&rules);
        Arc::new(move |domain: &str| {
            rules.add_suggestion(domain);
        })
    };
    let engine = ProbeEngine::new(config.listen_ip, level, suggest_fn);
    let probes = Arc::new(ProbeCache::new(Arc::new(engine)));

    let handler = Arc::new(QueryHandler::new(
        config.listen_ip,
        rules,
        upstream,
        trigger,
        probes,
    ));

    let listen_addr = SocketAddr::new(config.listen_ip, DNS_PORT);
    let server = match DnsServer::bind(listen_addr, handler).await {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "cannot bind DNS listener");
            return Err(err.into());
        }
    };
    info!(%listen_addr, "DNS listener up");

    server.run().await.context("DNS listener failed")
}
