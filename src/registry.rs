//! Control-plane service registry and reverse proxy.
//!
//! Keeps an in-memory multimap of `service -> instance addresses` plus a
//! round-robin cursor per service, everything under one exclusive lock.
//! Registration order is preserved and duplicate addresses are accepted.

use crate::error::{MeshError, Result};
use crate::listener::{full_body, HandlerBody};
use http::{header, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tower::Service;
use tracing::{error, info, instrument};

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
    address: String,
}

#[derive(Debug, Serialize)]
struct DiscoverResponse {
    address: String,
}

#[derive(Default)]
struct PlaneState {
    services: HashMap<String, Vec<String>>,
    cursors: HashMap<String, usize>,
}

impl PlaneState {
    fn register(&mut self, name: String, address: String) {
        self.services.entry(name).or_default().push(address);
    }

    /// Round-robin selection: returns the cursor's instance and advances it.
    fn next_address(&mut self, name: &str) -> Option<String> {
        let instances = self.services.get(name)?;
        let cursor = self.cursors.entry(name.to_string()).or_insert(0);

        let address = instances[*cursor % instances.len()].clone();
        *cursor = (*cursor + 1) % instances.len();

        Some(address)
    }
}

/// Control-plane HTTP service.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<PlaneShared>,
}

struct PlaneShared {
    state: Mutex<PlaneState>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PlaneShared {
                state: Mutex::new(PlaneState::default()),
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
        }
    }

    /// Registers an instance address under a service name.
    pub fn register_instance(&self, name: impl Into<String>, address: impl Into<String>) {
        self.inner.state.lock().register(name.into(), address.into());
    }

    /// Returns the next instance for a service by round robin.
    pub fn next_address(&self, name: &str) -> Option<String> {
        self.inner.state.lock().next_address(name)
    }

    async fn handle(self, req: Request<Incoming>) -> Response<HandlerBody> {
        let path = req.uri().path();

        if path == "/register" && req.method() == Method::POST {
            return self.register_handler(req).await;
        }
        if path == "/discover" {
            return self.discover_handler(&req);
        }
        if path == "/api" || path.starts_with("/api/") {
            return self.proxy_handler(req).await;
        }

        plain_response(StatusCode::NOT_FOUND, "Not Found")
    }

    async fn register_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return plain_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let parsed: RegisterRequest = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => return plain_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        info!(service = %parsed.name, address = %parsed.address, "registering instance");
        self.register_instance(parsed.name, parsed.address);

        Response::builder()
            .status(StatusCode::OK)
            .body(full_body(""))
            .unwrap_or_else(|_| Response::new(full_body("")))
    }

    fn discover_handler(&self, req: &Request<Incoming>) -> Response<HandlerBody> {
        let Some(name) = query_param(req.uri(), "service") else {
            return plain_response(StatusCode::BAD_REQUEST, "missing 'service' parameter");
        };

        let Some(address) = self.next_address(&name) else {
            return plain_response(StatusCode::NOT_FOUND, "Not Found");
        };

        match serde_json::to_vec(&DiscoverResponse { address }) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(full_body(body))
                .unwrap_or_else(|_| Response::new(full_body(""))),
            Err(e) => {
                error!("failed to marshal discover response: {}", e);
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    /// Transparent reverse proxy: resolves the `Host` header's first label
    /// through the registry and forwards with `/api` stripped.
    #[instrument(level = "info", skip(self, req), fields(uri = %req.uri()))]
    async fn proxy_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        info!("incoming request");

        let upstream_req = match self.proxy_request(req).await {
            Ok(r) => r,
            Err(e) => {
                error!("failed to create proxy request: {}", e);
                return plain_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        };

        match self.inner.client.request(upstream_req).await {
            Ok(resp) => resp.map(|body| body.boxed()),
            Err(e) => {
                error!("failed to proxy request: {}", e);
                plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn proxy_request(&self, req: Request<Incoming>) -> Result<Request<Full<Bytes>>> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let target = self.resolve_host(&host)?;
        let (parts, body) = req.into_parts();

        let path = parts.uri.path();
        let path = path.strip_prefix("/api").unwrap_or(path);
        let mut url = format!("http://{target}{path}");
        if let Some(query) = parts.uri.query() {
            url.push('?');
            url.push_str(query);
        }
        let uri: Uri = url
            .parse()
            .map_err(|e| MeshError::UpstreamFailure(format!("failed to build upstream uri: {e}")))?;

        let body = body
            .collect()
            .await
            .map_err(|e| MeshError::UpstreamFailure(format!("failed to read request body: {e}")))?
            .to_bytes();

        let mut upstream_req = Request::new(Full::new(body));
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = parts.headers;
        upstream_req.headers_mut().remove(header::HOST);

        Ok(upstream_req)
    }

    /// Resolves a `<service>.<rest>` host to the next instance address.
    fn resolve_host(&self, host: &str) -> Result<String> {
        let parts: Vec<&str> = host.split('.').collect();
        if parts.len() != 2 {
            return Err(MeshError::UpstreamFailure(format!("invalid host: {host}")));
        }

        self.next_address(parts[0])
            .ok_or_else(|| MeshError::NotFound(format!("service {:?}", parts[0])))
    }
}

impl Service<Request<Incoming>> for ControlPlane {
    type Response = Response<HandlerBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

fn plain_response(status: StatusCode, message: &str) -> Response<HandlerBody> {
    Response::builder()
        .status(status)
        .body(full_body(message.to_string()))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_selection() {
        let plane = ControlPlane::new();
        plane.register_instance("counter", "counter-1-sidecar:8080");
        plane.register_instance("counter", "counter-2-sidecar:8080");
        plane.register_instance("counter", "counter-3-sidecar:8080");

        assert_eq!(plane.next_address("counter").unwrap(), "counter-1-sidecar:8080");
        assert_eq!(plane.next_address("counter").unwrap(), "counter-2-sidecar:8080");
        assert_eq!(plane.next_address("counter").unwrap(), "counter-3-sidecar:8080");
        assert_eq!(plane.next_address("counter").unwrap(), "counter-1-sidecar:8080");
    }

    #[test]
    fn test_round_robin_fairness() {
        let plane = ControlPlane::new();
        let n = 3;
        let k = 5;
        for i in 1..=n {
            plane.register_instance("svc", format!("svc-{i}-sidecar:8080"));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..(n * k) {
            *counts.entry(plane.next_address("svc").unwrap()).or_default() += 1;
        }

        for i in 1..=n {
            assert_eq!(counts[&format!("svc-{i}-sidecar:8080")], k);
        }
    }

    #[test]
    fn test_unknown_service() {
        let plane = ControlPlane::new();
        assert!(plane.next_address("ghost").is_none());
    }

    #[test]
    fn test_duplicate_addresses_allowed() {
        let plane = ControlPlane::new();
        plane.register_instance("svc", "a:8080");
        plane.register_instance("svc", "a:8080");

        assert_eq!(plane.next_address("svc").unwrap(), "a:8080");
        assert_eq!(plane.next_address("svc").unwrap(), "a:8080");
    }

    #[test]
    fn test_registration_grows_rotation() {
        let plane = ControlPlane::new();
        plane.register_instance("svc", "a:8080");
        assert_eq!(plane.next_address("svc").unwrap(), "a:8080");

        // The cursor wrapped back to the head, so the grown list is walked
        // from the start again.
        plane.register_instance("svc", "b:8080");
        assert_eq!(plane.next_address("svc").unwrap(), "a:8080");
        assert_eq!(plane.next_address("svc").unwrap(), "b:8080");
        assert_eq!(plane.next_address("svc").unwrap(), "a:8080");
    }

    #[test]
    fn test_resolve_host_shapes() {
        let plane = ControlPlane::new();
        plane.register_instance("counter", "counter-1-sidecar:8080");

        assert_eq!(
            plane.resolve_host("counter.localhost").unwrap(),
            "counter-1-sidecar:8080"
        );
        assert!(plane.resolve_host("counter").is_err());
        assert!(plane.resolve_host("ghost.localhost").is_err());
    }
}
