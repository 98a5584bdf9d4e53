//! Resolver Configuration
//!
//! Everything needed to reach the API server for the Endpoints seed fetch
//! and to tune the address cache. Defaults mirror a stock cluster: the
//! `kubernetes` service in the `default` namespace.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the API server resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    // === Target ===

    /// API server base URL, e.g. `https://api.cluster.local:6443`.
    /// The host must be a DNS name, literal IPs need no resolver.
    pub server: String,

    /// Namespace of the service fronting the API servers
    pub namespace: String,

    /// Service whose Endpoints list every API server
    pub service: String,

    // === Credentials ===

    /// Bearer token sent with the Endpoints request
    pub bearer_token: Option<String>,

    /// File holding the bearer token (read at construction time)
    pub bearer_token_file: Option<PathBuf>,

    /// PEM bundle used to verify the API server certificate
    pub ca_file: Option<PathBuf>,

    /// Skip TLS verification (testing only)
    pub insecure_skip_tls_verify: bool,

    /// User agent for the Endpoints request
    pub user_agent: Option<String>,

    // === Timing ===

    /// How long cached addresses are trusted without a successful refresh
    pub stale_timeout_secs: u64,

    /// Timeout of a single Endpoints request
    pub request_timeout_secs: u64,

    /// Upper bound for the system resolver fallback
    pub fallback_timeout_secs: u64,

    // === Ordering ===

    /// Seed for the address shuffle; random when unset
    pub shuffle_seed: Option<u64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            server: "https://kubernetes.default.svc:443".to_string(),
            namespace: "default".to_string(),
            service: "kubernetes".to_string(),

            bearer_token: None,
            bearer_token_file: None,
            ca_file: None,
            insecure_skip_tls_verify: false,
            user_agent: None,

            stale_timeout_secs: 100,
            request_timeout_secs: 30,
            fallback_timeout_secs: 10,

            shuffle_seed: None,
        }
    }
}

impl ResolverConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    // Builder-style methods for CLI overrides

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    /// Token from `bearer_token`, or else from `bearer_token_file`
    pub fn resolve_bearer_token(&self) -> anyhow::Result<Option<String>> {
        if let Some(token) = &self.bearer_token {
            return Ok(Some(token.clone()));
        }
        match &self.bearer_token_file {
            Some(path) => {
                let token = std::fs::read_to_string(path)?;
                Ok(Some(token.trim().to_string()))
            }
            None => Ok(None),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.is_empty() {
            anyhow::bail!("server must be set");
        }

        if self.namespace.is_empty() || self.service.is_empty() {
            anyhow::bail!("namespace and service must not be empty");
        }

        if self.stale_timeout_secs == 0 {
            anyhow::bail!("stale_timeout_secs must be greater than zero");
        }

        if self.request_timeout_secs == 0 || self.fallback_timeout_secs == 0 {
            anyhow::bail!(
                "request_timeout_secs ({}) and fallback_timeout_secs ({}) must be greater than zero",
                self.request_timeout_secs,
                self.fallback_timeout_secs
            );
        }

        if self.bearer_token.is_some() && self.bearer_token_file.is_some() {
            anyhow::bail!("bearer_token and bearer_token_file are mutually exclusive");
        }

        Ok(())
    }
}
