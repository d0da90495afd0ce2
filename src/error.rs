//! Error types shared across the proxy.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that prevent the proxy from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid backend address '{address}': {source}")]
    InvalidBackendUrl {
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported backend address '{address}': {reason}")]
    UnsupportedBackend { address: String, reason: &'static str },

    #[error("Invalid listen address '{0}'")]
    InvalidListenAddr(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("At least one backend must be configured")]
    Empty,
}

/// A failed exchange with an upstream server.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("I/O error talking to upstream: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from upstream: {0}")]
    InvalidResponse(String),
}
