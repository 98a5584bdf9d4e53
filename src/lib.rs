//! API server address resolution
//!
//! Keeps a client talking to a clustered control plane even when the load
//! balancer or DNS entry in its kubeconfig goes away. The API server host
//! name is resolved to the addresses published in the control plane's own
//! Endpoints object, with the system resolver as fallback.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    APISERVER RESOLVER                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ApiServerResolver  ←── reqwest::dns::Resolve for the host   │
//! │  AddressCache       ←── Endpoints seed, shuffle, local first │
//! │  SystemResolver     ←── fallback when the cache is empty     │
//! │  MemDialer/MemConn  ←── in-memory DNS over the cache         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod lookup;
pub mod resolver;

pub use config::ResolverConfig;
pub use error::Error;
pub use lookup::{IpFamily, LookupError, LookupIp, SystemResolver};
pub use resolver::{resilient_client, AddressCache, ApiServerResolver};
