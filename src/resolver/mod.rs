//! API Server Resolver
//!
//! Resolves the configured API server host name to the addresses of every
//! API server instance, as published in the control plane's Endpoints
//! object, instead of whatever single load balancer or static entry DNS
//! would return.
//!
//! ## Flow
//!
//! 1. Construction parses the server URL, builds the Endpoints REST client
//!    and runs one refresh so the cache is warm before the first request.
//! 2. Lookups for the configured host are served by the [`AddressCache`];
//!    anything else goes to the system resolver untouched.
//! 3. The cache refreshes itself in the background whenever a lookup
//!    suggests the previous address did not work.
//!
//! [`ApiServerResolver`] implements `reqwest::dns::Resolve`, so it plugs
//! into any `reqwest::ClientBuilder`; [`resilient_client`] does exactly
//! that.

pub mod cache;
pub mod endpoints;
pub mod local;

pub use cache::{AddressCache, CacheOptions, CacheSnapshot, Target};
pub use endpoints::{EndpointSource, Endpoints, EndpointsClient, FetchError};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ResolverConfig;
use crate::dns::{answer_from_lookup, MemDialer, VirtualResolver};
use crate::error::Error;
use crate::lookup::{IpFamily, LookupError, LookupIp, SystemResolver};

/// TTL of records served through the in-memory DNS
const ANSWER_TTL: u32 = 30;

/// Resolver for the API server host backed by the Endpoints cache
#[derive(Debug, Clone)]
pub struct ApiServerResolver {
    cache: AddressCache,
    query_timeout: Duration,
}

impl ApiServerResolver {
    /// Build the resolver from configuration and run the initial refresh
    pub async fn new(config: &ResolverConfig) -> Result<Self, Error> {
        config.validate()?;

        let target = parse_target(&config.server)?;
        let source = Arc::new(EndpointsClient::new(config)?);
        let system = Arc::new(SystemResolver::new(config.fallback_timeout()));
        let options = CacheOptions::default()
            .with_stale_timeout(config.stale_timeout())
            .with_seed(config.shuffle_seed);

        info!(
            "Resolving {}:{} from endpoints {}",
            target.host,
            target.port,
            source.url()
        );

        let mut resolver = Self::with_parts(target, system, source, options).await;
        resolver.query_timeout = config.fallback_timeout();
        Ok(resolver)
    }

    /// Build the resolver around explicit collaborators and run the
    /// initial refresh
    pub async fn with_parts(
        target: Target,
        system: Arc<dyn LookupIp>,
        source: Arc<dyn EndpointSource>,
        options: CacheOptions,
    ) -> Self {
        let cache = AddressCache::new(target, system, source, options);
        cache.refresh().await;
        debug!("Initial address cache: {:?}", cache.snapshot().addresses);

        Self {
            cache,
            query_timeout: Duration::from_secs(10),
        }
    }

    pub async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        self.cache.lookup_ip(family, host).await
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    /// Dialer whose in-memory DNS connections answer from the cache
    pub fn dialer(&self) -> MemDialer {
        let lookup: Arc<dyn LookupIp> = Arc::new(self.cache.clone());
        MemDialer::new(answer_from_lookup(lookup, ANSWER_TTL))
    }

    /// Stub resolver speaking DNS to [`Self::dialer`]
    pub fn virtual_resolver(&self) -> VirtualResolver {
        VirtualResolver::new(self.dialer(), self.query_timeout)
    }
}

impl Resolve for ApiServerResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = self.cache.clone();
        Box::pin(async move {
            let ips = cache.lookup_ip(IpFamily::Any, name.as_str()).await?;
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// HTTP client for the API server that resolves its host through an
/// [`ApiServerResolver`]
pub async fn resilient_client(config: &ResolverConfig) -> Result<reqwest::Client, Error> {
    let resolver = ApiServerResolver::new(config).await?;
    let client = endpoints::client_builder(config)?
        .dns_resolver(Arc::new(resolver))
        .build()?;
    Ok(client)
}

/// Host and port of the API server URL. The host must be a name: there is
/// nothing to resolve for a literal IP.
pub fn parse_target(server: &str) -> Result<Target, Error> {
    let url = reqwest::Url::parse(server).map_err(|e| Error::InvalidUrl {
        url: server.to_string(),
        reason: e.to_string(),
    })?;

    let default_port = match url.scheme() {
        "http" => 80,
        "https" => 443,
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };

    let host = url.host_str().ok_or_else(|| Error::InvalidUrl {
        url: server.to_string(),
        reason: "missing host".to_string(),
    })?;

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Err(Error::LiteralIp(ip));
    }

    Ok(Target::new(host, url.port().unwrap_or(default_port)))
}
