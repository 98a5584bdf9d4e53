//! Endpoints seed source
//!
//! The control plane publishes the address of every API server in the
//! Endpoints object of its service (`default/kubernetes` on a stock
//! cluster). Only the fields the refresher needs are modelled:
//!
//! ```json
//! {"subsets": [{"addresses": [{"ip": "10.0.0.1"}], "ports": [{"port": 6443}]}]}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::error::Error;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    /// Ready addresses
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,

    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A subset does not serve exactly the target port
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("endpoint subset serves ports {found:?}, expected only {expected}")]
pub struct PortMismatch {
    pub expected: u16,
    pub found: Vec<i32>,
}

impl Endpoints {
    /// Build an Endpoints object with one subset per port
    pub fn from_subsets<I>(subsets: I) -> Self
    where
        I: IntoIterator<Item = (Vec<IpAddr>, u16)>,
    {
        Self {
            subsets: subsets
                .into_iter()
                .map(|(ips, port)| EndpointSubset {
                    addresses: ips
                        .into_iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            hostname: None,
                        })
                        .collect(),
                    ports: vec![EndpointPort {
                        name: None,
                        port: i32::from(port),
                        protocol: None,
                    }],
                })
                .collect(),
        }
    }

    /// Every address of every subset, provided each subset serves exactly
    /// `port` and nothing else. Unparseable addresses are skipped.
    pub fn addresses_for_port(&self, port: u16) -> Result<Vec<IpAddr>, PortMismatch> {
        let mut ips = Vec::new();
        for subset in &self.subsets {
            if subset.ports.len() != 1 || subset.ports[0].port != i32::from(port) {
                return Err(PortMismatch {
                    expected: port,
                    found: subset.ports.iter().map(|p| p.port).collect(),
                });
            }

            for address in &subset.addresses {
                match address.ip.parse::<IpAddr>() {
                    Ok(ip) => ips.push(ip),
                    Err(_) => warn!("Ignoring unparseable endpoint address {:?}", address.ip),
                }
            }
        }
        Ok(ips)
    }
}

// =============================================================================
// SOURCE
// =============================================================================

/// Seed fetch failure; consumed by the refresher, never seen by lookups
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {0}")]
    Status(reqwest::StatusCode),
}

/// Anything able to produce the current Endpoints object
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn fetch_endpoints(&self) -> Result<Endpoints, FetchError>;
}

pub fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// REST client for the core `v1` Endpoints resource.
///
/// Uses a plain `reqwest::Client` that resolves names the ordinary way, so
/// the seed fetch never depends on the cache it feeds.
#[derive(Debug, Clone)]
pub struct EndpointsClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl EndpointsClient {
    pub fn new(config: &ResolverConfig) -> Result<Self, Error> {
        Ok(Self {
            http: client_builder(config)?.build()?,
            url: endpoints_url(&config.server, &config.namespace, &config.service),
            token: config.resolve_bearer_token()?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EndpointSource for EndpointsClient {
    async fn fetch_endpoints(&self) -> Result<Endpoints, FetchError> {
        debug!("Fetching endpoints from {}", self.url);

        let mut request = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        Ok(response.json::<Endpoints>().await?)
    }
}

/// HTTP client settings shared by every client talking to the API server:
/// timeout, user agent and TLS trust
pub(crate) fn client_builder(config: &ResolverConfig) -> Result<reqwest::ClientBuilder, Error> {
    let user_agent = config
        .user_agent
        .clone()
        .unwrap_or_else(default_user_agent);

    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .user_agent(user_agent);

    if let Some(ca_file) = &config.ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| Error::Config(format!("reading CA file {}: {}", ca_file.display(), e)))?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    if config.insecure_skip_tls_verify {
        warn!("TLS verification disabled for API server connections");
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder)
}

fn endpoints_url(server: &str, namespace: &str, service: &str) -> String {
    format!(
        "{}/api/v1/namespaces/{}/endpoints/{}",
        server.trim_end_matches('/'),
        namespace,
        service
    )
}
