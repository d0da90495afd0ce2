//! Backend servers
//!
//! A backend is anything that can report an address and a liveness flag and
//! forward a single request. `HttpBackend` is the real implementation; tests
//! substitute their own.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::parse_backend_url;
use crate::error::{ConfigError, ForwardError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::proxy::upstream::Upstream;

/// An upstream target the front door can dispatch to.
pub trait Backend: Send + Sync + 'static {
    /// The upstream base URL, exactly as configured.
    fn address(&self) -> &str;

    /// Current liveness. Dead backends are skipped by the registry.
    fn is_alive(&self) -> bool;

    /// Performs one request/response exchange with the upstream.
    fn forward(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Response, ForwardError>> + Send;
}

/// A backend reached over HTTP/1.1, in plain text or over TLS.
///
/// Liveness starts out `true` and is only ever changed through
/// [`HttpBackend::set_alive`], which is the hook for an external health
/// checker. Forwarding failures do not touch it.
#[derive(Debug)]
pub struct HttpBackend {
    address: String,
    alive: AtomicBool,
    upstream: Upstream,
}

impl HttpBackend {
    /// Parses `address` and builds a backend for it.
    ///
    /// Fails on anything that is not an absolute `http://` or `https://` URL
    /// with a host.
    pub fn parse(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let url = parse_backend_url(address)?;
        Ok(Self {
            address: address.to_string(),
            alive: AtomicBool::new(true),
            upstream: Upstream::new(url, connect_timeout, request_timeout),
        })
    }

    /// Updates liveness. Safe to call from any thread at any time.
    pub fn set_alive(&self, alive: bool) {
        let was = self.alive.swap(alive, Ordering::Relaxed);
        if was != alive {
            if alive {
                tracing::info!(backend = %self.address, "Backend marked alive");
            } else {
                tracing::warn!(backend = %self.address, "Backend marked dead");
            }
        }
    }
}

impl Backend for HttpBackend {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn forward(&self, request: &Request) -> Result<Response, ForwardError> {
        self.upstream.send(request).await
    }
}
