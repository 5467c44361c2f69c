//! Sidecar data-plane proxy.
//!
//! One HTTP listener per sidecar, three routes: the metrics scrape
//! endpoint, `/address` for explicit resolution, and a catch-all proxy.
//!
//! The proxy classifies by `Host`: a request carrying the sidecar's own
//! host (`<service>-sidecar:<port>`) is egress from the co-located
//! application and goes to the local target; anything else is ingress from
//! a peer and is resolved through the control plane by the first label of
//! the host name.

use crate::client::ResilientClient;
use crate::config::SidecarConfig;
use crate::error::{MeshError, Result};
use crate::listener::{client_ip, full_body, HandlerBody};
use crate::metrics::Metrics;
use http::{header, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tower::Service;
use tracing::{error, info, instrument};

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    address: String,
}

/// Sidecar proxy service.
#[derive(Clone)]
pub struct Sidecar {
    inner: Arc<SidecarShared>,
}

struct SidecarShared {
    cfg: SidecarConfig,
    own_host: String,
    client: ResilientClient,
    metrics: Arc<Metrics>,
    discover_cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl Sidecar {
    pub fn new(cfg: SidecarConfig, client: ResilientClient, metrics: Arc<Metrics>) -> Self {
        let own_host = cfg.own_host();
        Self {
            inner: Arc::new(SidecarShared {
                cfg,
                own_host,
                client,
                metrics,
                discover_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn handle(self, req: Request<Incoming>) -> Response<HandlerBody> {
        match req.uri().path() {
            "/metrics" => self.metrics_response(),
            "/address" => self.address_handler(&req).await,
            _ => {
                let start = Instant::now();
                let resp = self.proxy_handler(req).await;
                self.inner
                    .metrics
                    .observe_duration(start.elapsed().as_secs_f64());
                resp
            }
        }
    }

    fn metrics_response(&self) -> Response<HandlerBody> {
        match self.inner.metrics.encode() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(full_body(body))
                .unwrap_or_else(|_| Response::new(full_body(""))),
            Err(e) => {
                error!("failed to encode metrics: {}", e);
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    async fn address_handler(&self, req: &Request<Incoming>) -> Response<HandlerBody> {
        let Some(name) = query_param(req.uri(), "service") else {
            return plain_response(StatusCode::BAD_REQUEST, "missing 'service' parameter");
        };

        match self.discover(&name).await {
            Ok(target) => plain_response(StatusCode::OK, &target),
            Err(e) => {
                error!("failed to get target address: {}", e);
                plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    #[instrument(level = "info", skip(self, req), fields(uri = %req.uri()))]
    async fn proxy_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        info!("incoming request");

        let host = request_host(&req);

        let target = if host == self.inner.own_host {
            // Egress from the co-located application.
            self.inner.cfg.target.clone()
        } else {
            let service = match service_name(&host) {
                Ok(name) => name,
                Err(e) => {
                    error!("failed to get service name: {}", e);
                    return self.bad_gateway();
                }
            };

            match self.discover(&service).await {
                Ok(target) => target,
                Err(e) => {
                    error!("failed to get target address: {}", e);
                    return self.bad_gateway();
                }
            }
        };

        let upstream_req = match self.proxy_request(req, &target).await {
            Ok(r) => r,
            Err(e) => {
                error!("failed to create proxy request: {}", e);
                return self.bad_gateway();
            }
        };

        match self.inner.client.request(upstream_req).await {
            Ok(resp) => {
                self.inner.metrics.inc_total_requests(resp.status().as_u16());
                resp.map(|body| body.boxed())
            }
            Err(e) => {
                error!("failed to proxy request: {}", e);
                self.bad_gateway()
            }
        }
    }

    /// Rebuilds the incoming request against the target, stripping the
    /// `/api` prefix and stamping `X-Forwarded-For` with the caller's IP.
    async fn proxy_request(
        &self,
        req: Request<Incoming>,
        target: &str,
    ) -> Result<Request<Bytes>> {
        let ip = client_ip(&req);
        let (parts, body) = req.into_parts();

        let uri = build_upstream_uri(target, &parts.uri)?;

        let body = match timeout(self.inner.cfg.read_timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                return Err(MeshError::UpstreamFailure(format!(
                    "failed to read request body: {e}"
                )))
            }
            Err(_) => {
                return Err(MeshError::UpstreamFailure(
                    "timed out reading request body".to_string(),
                ))
            }
        };

        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = parts.headers;

        // The upstream hop gets its own Host from the target URI.
        upstream_req.headers_mut().remove(header::HOST);
        upstream_req.headers_mut().insert(
            "x-forwarded-for",
            ip.parse()
                .map_err(|_| MeshError::UpstreamFailure("invalid client ip".to_string()))?,
        );

        Ok(upstream_req)
    }

    /// Resolves a service name through the control plane, with an optional
    /// TTL cache in front.
    async fn discover(&self, name: &str) -> Result<String> {
        let ttl = self.inner.cfg.discover_cache_ttl;

        if ttl > Duration::ZERO {
            let cache = self.inner.discover_cache.lock();
            if let Some((addr, resolved_at)) = cache.get(name) {
                if resolved_at.elapsed() < ttl {
                    return Ok(addr.clone());
                }
            }
        }

        let url = format!("{}/discover?service={}", self.inner.cfg.plane_url, name);
        let resp = self.inner.client.get(&url).await?;

        if resp.status() != StatusCode::OK {
            return Err(MeshError::InvalidStatusCode(resp.status().as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| MeshError::UpstreamFailure(format!("failed to read discover body: {e}")))?
            .to_bytes();

        let decoded: DiscoverResponse = serde_json::from_slice(&body)
            .map_err(|e| MeshError::UpstreamFailure(format!("failed to decode discover body: {e}")))?;

        if ttl > Duration::ZERO {
            self.inner
                .discover_cache
                .lock()
                .insert(name.to_string(), (decoded.address.clone(), Instant::now()));
        }

        Ok(decoded.address)
    }

    fn bad_gateway(&self) -> Response<HandlerBody> {
        self.inner
            .metrics
            .inc_total_requests(StatusCode::BAD_GATEWAY.as_u16());
        plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }
}

impl Service<Request<Incoming>> for Sidecar {
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

/// Host the request was addressed to.
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Extracts the service name from a peer host of the shape `<name>.<rest>`.
fn service_name(host: &str) -> Result<String> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() != 2 {
        return Err(MeshError::UpstreamFailure(format!("invalid host: {host}")));
    }

    Ok(parts[0].to_string())
}

/// Builds the upstream URI: `http://<target><path-without-/api><query>`.
fn build_upstream_uri(target: &str, original: &Uri) -> Result<Uri> {
    let path = original.path();
    let path = path.strip_prefix("/api").unwrap_or(path);

    let mut url = format!("http://{target}{path}");
    if let Some(query) = original.query() {
        url.push('?');
        url.push_str(query);
    }

    url.parse()
        .map_err(|e| MeshError::UpstreamFailure(format!("failed to build upstream uri: {e}")))
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
