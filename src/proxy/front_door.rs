//! Request dispatch
//!
//! Every inbound request goes through [`FrontDoor::handle`], which picks a
//! backend from the registry and hands the request to it. Per-request
//! failures become error responses; nothing here can bring the process down.

use std::sync::Arc;

use crate::error::ForwardError;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::proxy::backend::Backend;
use crate::proxy::registry::{Registry, Selection};

/// Single entry point for all proxied traffic.
#[derive(Debug)]
pub struct FrontDoor<B> {
    registry: Arc<Registry<B>>,
}

impl<B: Backend> FrontDoor<B> {
    pub fn new(registry: Arc<Registry<B>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry<B>> {
        &self.registry
    }

    /// Dispatches one request and produces the response for the client.
    ///
    /// - no live backend: 503
    /// - upstream timed out: 504
    /// - any other forwarding failure: 502
    pub async fn handle(&self, request: &Request) -> Response {
        let backend = match self.registry.next() {
            Selection::Found(backend) => backend,
            Selection::Unavailable => {
                tracing::error!(
                    backends = self.registry.len(),
                    method = request.method.as_str(),
                    path = %request.path,
                    "No available backends in pool"
                );
                return Response::service_unavailable();
            }
        };

        tracing::info!(
            backend = backend.address(),
            method = request.method.as_str(),
            path = %request.path,
            "Forwarding request"
        );

        match backend.forward(request).await {
            Ok(response) => {
                tracing::debug!(
                    backend = backend.address(),
                    status = response.status.as_u16(),
                    "Upstream responded"
                );
                response
            }
            Err(e) => {
                tracing::warn!(
                    backend = backend.address(),
                    error = %e,
                    method = request.method.as_str(),
                    path = %request.path,
                    "Failed to forward request to backend"
                );
                match e {
                    ForwardError::Timeout(_) => Response::gateway_timeout(),
                    _ => Response::bad_gateway(),
                }
            }
        }
    }
}
