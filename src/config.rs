//! Proxy configuration.
//!
//! With nothing set, the proxy listens on port 8000 and balances across
//! three public HTTPS sites. A YAML file named by `TURNSTILE_CONFIG` can replace
//! any field, and `LISTEN` overrides the listen address on top of that.
//!
//! ```yaml
//! listen_addr: "0.0.0.0:8000"
//! backends:
//!   - http://10.0.0.1:8080
//!   - http://10.0.0.2:8080
//! connect_timeout_secs: 5
//! request_timeout_secs: 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;
use crate::proxy::{HttpBackend, Registry};

/// Environment variable naming a YAML config file.
pub const CONFIG_ENV: &str = "TURNSTILE_CONFIG";

/// Environment variable overriding `listen_addr`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_addr: String,
    /// Backend base URLs, in rotation order.
    pub backends: Vec<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            backends: vec![
                "https://www.facebook.com".to_string(),
                "https://www.google.com".to_string(),
                "https://www.bing.com".to_string(),
            ],
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Loads the config from the environment, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var(LISTEN_ENV) {
            cfg.listen_addr = listen_addr;
        }

        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Port part of `listen_addr`, for the startup banner.
    pub fn listen_port(&self) -> Result<u16, ConfigError> {
        self.listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .ok_or_else(|| ConfigError::InvalidListenAddr(self.listen_addr.clone()))
    }

    /// Validates every backend address, in order.
    pub fn backend_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.backends.iter().map(|a| parse_backend_url(a)).collect()
    }

    /// Builds the backend registry. Any bad address aborts the whole build.
    pub fn build_registry(&self) -> Result<Registry<HttpBackend>, ConfigError> {
        let backends = self
            .backends
            .iter()
            .map(|address| {
                HttpBackend::parse(address, self.connect_timeout(), self.request_timeout())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Registry::new(backends)?)
    }
}

/// Parses one backend address.
///
/// Accepts absolute `http` and `https` URLs with a host and no fragment.
pub fn parse_backend_url(address: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(address).map_err(|source| ConfigError::InvalidBackendUrl {
        address: address.to_string(),
        source,
    })?;

    let unsupported = |reason| ConfigError::UnsupportedBackend {
        address: address.to_string(),
        reason,
    };

    if !matches!(url.scheme(), "http" | "https") {
        return Err(unsupported("only http:// and https:// backends are supported"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(unsupported("missing host"));
    }
    if url.fragment().is_some() {
        return Err(unsupported("fragments are not allowed"));
    }

    Ok(url)
}
