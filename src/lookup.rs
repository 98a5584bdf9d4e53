//! IP lookup abstraction
//!
//! [`LookupIp`] is the seam between the address cache and whatever answers
//! ordinary DNS questions. [`SystemResolver`] delegates to the operating
//! system through `tokio::net::lookup_host`.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::trace;

/// Address family requested by a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl IpFamily {
    /// Map a network name ("ip", "ip4", "tcp6", ...) to a family
    pub fn from_network(network: &str) -> Self {
        if network.ends_with('4') {
            Self::V4
        } else if network.ends_with('6') {
            Self::V6
        } else {
            Self::Any
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

/// Name resolution failure
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("lookup {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lookup {host}: timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("lookup {host}: no such host")]
    NotFound { host: String },
}

/// Anything able to turn a host name into IP addresses
#[async_trait]
pub trait LookupIp: Send + Sync {
    async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError>;
}

/// Operating system resolver with a bounded wait
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl LookupIp for SystemResolver {
    async fn lookup_ip(&self, family: IpFamily, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        trace!("System lookup for {} ({:?})", host, family);

        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| LookupError::Timeout {
                host: host.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| LookupError::Resolve {
                host: host.to_string(),
                source,
            })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            if family.matches(&ip) && !ips.contains(&ip) {
                ips.push(ip);
            }
        }

        if ips.is_empty() {
            return Err(LookupError::NotFound {
                host: host.to_string(),
            });
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_family_from_network() {
        assert_eq!(IpFamily::from_network("ip"), IpFamily::Any);
        assert_eq!(IpFamily::from_network("ip4"), IpFamily::V4);
        assert_eq!(IpFamily::from_network("tcp6"), IpFamily::V6);
        assert_eq!(IpFamily::from_network("udp"), IpFamily::Any);
    }

    #[test]
    fn test_family_matches() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(IpFamily::Any.matches(&v4) && IpFamily::Any.matches(&v6));
        assert!(IpFamily::V4.matches(&v4) && !IpFamily::V4.matches(&v6));
        assert!(IpFamily::V6.matches(&v6) && !IpFamily::V6.matches(&v4));
    }

    #[tokio::test]
    async fn test_system_resolver_literal_ip() {
        let resolver = SystemResolver::default();
        let ips = resolver.lookup_ip(IpFamily::Any, "127.0.0.1").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

        let err = resolver.lookup_ip(IpFamily::V6, "127.0.0.1").await.unwrap_err();
        assert!(matches!(err, LookupError::NotFound { .. }));
    }
}
