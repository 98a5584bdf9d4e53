//! API server resolver CLI
//!
//! Builds an [`ApiServerResolver`] from a configuration file plus flags and
//! exercises it:
//!
//! - `lookup` resolves the API server host repeatedly, showing how the
//!   order rotates and what the cache holds after each call.
//! - `query` sends a DNS query through the in-memory DNS answered by the
//!   cache, over datagram or stream semantics.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use apiserver_resolver::dns::{RData, RecordType};
use apiserver_resolver::{ApiServerResolver, IpFamily, ResolverConfig};

/// Resolve the API server host from the control plane's Endpoints
#[derive(Parser, Debug)]
#[command(name = "apiserver-resolver")]
#[command(version)]
#[command(about = "Resolve API server addresses from the control plane's Endpoints", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "resolver.toml")]
    config: PathBuf,

    /// API server URL, overrides the configuration file
    #[arg(long, env = "APISERVER_URL")]
    server: Option<String>,

    /// Bearer token for the Endpoints request
    #[arg(long, env = "APISERVER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds cached addresses survive without a successful refresh
    #[arg(long)]
    stale_timeout: Option<u64>,

    /// Seed for the address shuffle
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a host repeatedly and print the order and cache state
    Lookup {
        /// Host to resolve (defaults to the API server host)
        host: Option<String>,

        /// Number of lookups
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,

        /// Pause between lookups in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Address family: any, 4 or 6
        #[arg(long, default_value = "any")]
        family: String,
    },

    /// Send a DNS query through the in-memory DNS
    Query {
        /// Name to query (defaults to the API server host)
        name: Option<String>,

        /// Record type: A, AAAA, TXT, ... or a number
        #[arg(short = 't', long = "type", default_value = "A")]
        qtype: String,

        /// Use stream semantics instead of datagram
        #[arg(long)]
        tcp: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🧭 API server resolver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if args.config.exists() {
        ResolverConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!("Config file not found, using defaults");
        ResolverConfig::default()
    };

    // Override config with CLI args
    let seed = args.seed.or(config.shuffle_seed);
    let mut config = config.with_shuffle_seed(seed);
    if let Some(server) = args.server {
        config = config.with_server(server);
    }
    if let Some(secs) = args.stale_timeout {
        config = config.with_stale_timeout(Duration::from_secs(secs));
    }
    if args.token.is_some() {
        config = config.with_bearer_token(args.token);
        config.bearer_token_file = None;
    }

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   Server: {}", config.server);
    info!("   Endpoints: {}/{}", config.namespace, config.service);
    info!("   Stale timeout: {}s", config.stale_timeout_secs);
    info!("   Fallback timeout: {}s", config.fallback_timeout_secs);

    let resolver = ApiServerResolver::new(&config).await?;
    let target = resolver.cache().target().clone();
    info!("✅ Resolver ready for {}:{}", target.host, target.port);

    match args.command {
        Command::Lookup {
            host,
            count,
            interval_ms,
            family,
        } => {
            let host = host.unwrap_or_else(|| target.host.clone());
            let family = parse_family(&family)?;

            for i in 1..=count {
                match resolver.lookup_ip(family, &host).await {
                    Ok(ips) => println!("#{} {} -> {:?}", i, host, ips),
                    Err(e) => println!("#{} {} -> error: {}", i, host, e),
                }

                let snapshot = resolver.cache().snapshot();
                println!(
                    "   cache: {:?} (consumed: {}, refreshing: {})",
                    snapshot.addresses, snapshot.consumed, snapshot.refreshing
                );

                if i < count {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }

        Command::Query { name, qtype, tcp } => {
            let name = name.unwrap_or_else(|| target.host.clone());
            let qtype = parse_record_type(&qtype)?;
            let network = if tcp { "tcp" } else { "udp" };

            let msg = resolver
                .virtual_resolver()
                .exchange(network, &name, qtype)
                .await?;

            println!(
                ";; {} {} over {}: {:?}, id {}{}",
                name,
                qtype,
                network,
                msg.header.rcode,
                msg.header.id,
                if msg.header.truncated { ", truncated" } else { "" }
            );
            for record in &msg.answers {
                let data = match &record.data {
                    RData::A(ip) => ip.to_string(),
                    RData::Aaaa(ip) => ip.to_string(),
                    RData::Txt(strings) => format!("{:?}", strings),
                    RData::Raw(bytes) => format!("<{} bytes>", bytes.len()),
                };
                println!("{}\t{}\t{}\t{}", record.name, record.ttl, record.rtype, data);
            }
        }
    }

    Ok(())
}

fn parse_family(value: &str) -> anyhow::Result<IpFamily> {
    match value.to_ascii_lowercase().as_str() {
        "any" | "ip" => Ok(IpFamily::Any),
        "4" | "ip4" | "v4" => Ok(IpFamily::V4),
        "6" | "ip6" | "v6" => Ok(IpFamily::V6),
        other => anyhow::bail!("unknown address family {:?}", other),
    }
}

fn parse_record_type(value: &str) -> anyhow::Result<RecordType> {
    let rtype = match value.to_ascii_uppercase().as_str() {
        "A" => RecordType::A,
        "NS" => RecordType::NS,
        "CNAME" => RecordType::CNAME,
        "TXT" => RecordType::TXT,
        "AAAA" => RecordType::AAAA,
        "ANY" => RecordType::ANY,
        other => RecordType(
            other
                .trim_start_matches("TYPE")
                .parse()
                .with_context(|| format!("unknown record type {:?}", value))?,
        ),
    };
    Ok(rtype)
}
