//! Construction errors
//!
//! Failures that can happen while building an [`crate::ApiServerResolver`]
//! or the HTTP clients around it. Runtime failures have their own enums
//! next to the code producing them.

use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),

    #[error("server host {0} is already an IP address")]
    LiteralIp(IpAddr),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Config(format!("{:#}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
