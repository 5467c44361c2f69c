//! Resilient HTTP client used for all outbound traffic.
//!
//! Two layers, inside-out: a circuit-breaker transport guarding each
//! outbound host, and a retry engine with backoff on top of it. Responses
//! with status ≥ 500 count as breaker failures but are still handed to the
//! retry layer, which makes its own call; a breaker-open rejection is
//! surfaced to the caller immediately and never retried.

pub mod backoff;
pub mod breaker;

use crate::config::{BackoffType, ClientConfig};
use crate::error::{MeshError, Result};
use breaker::CircuitBreaker;
use dashmap::DashMap;
use http::{Method, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Outbound request engine with per-host circuit breakers and retries.
///
/// Request bodies are buffered `Bytes` so attempts can be replayed.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: Client<HttpConnector, Full<Bytes>>,
    cfg: ClientConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ResilientClient {
    pub fn new(cfg: &ClientConfig) -> Self {
        let http = Client::builder(TokioExecutor::new()).build_http();

        Self {
            inner: Arc::new(ClientInner {
                http,
                cfg: cfg.clone(),
                breakers: DashMap::new(),
            }),
        }
    }

    /// Issues a GET request with an empty body.
    pub async fn get(&self, uri: &str) -> Result<Response<Incoming>> {
        let uri: http::Uri = uri
            .parse()
            .map_err(|e| MeshError::UpstreamFailure(format!("invalid uri {uri:?}: {e}")))?;

        let mut req = Request::new(Bytes::new());
        *req.method_mut() = Method::GET;
        *req.uri_mut() = uri;

        self.request(req).await
    }

    /// Sends the request, retrying per configuration.
    ///
    /// At most `retry_max` additional attempts are made after the first.
    /// Retried outcomes are transport errors and responses with status 408,
    /// 429 or 500–599. A `Retry-After: N` header on a retryable response is
    /// honoured exactly; otherwise the configured backoff policy applies.
    pub async fn request(&self, req: Request<Bytes>) -> Result<Response<Incoming>> {
        let (parts, body) = req.into_parts();
        let target = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let retry = &self.inner.cfg.retry;

        let mut attempt = 0u32;
        loop {
            let mut attempt_req = Request::new(Full::new(body.clone()));
            *attempt_req.method_mut() = parts.method.clone();
            *attempt_req.uri_mut() = parts.uri.clone();
            *attempt_req.headers_mut() = parts.headers.clone();

            match self.round_trip(&target, attempt_req).await {
                Ok(resp) => {
                    if attempt < retry.retry_max && retryable_status(resp.status()) {
                        let delay = backoff::retry_after(resp.headers()).unwrap_or_else(|| {
                            backoff::delay(
                                retry.backoff_type,
                                retry.retry_wait_min,
                                retry.retry_wait_max,
                                attempt,
                            )
                        });

                        warn!(
                            target = %target,
                            status = resp.status().as_u16(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying after retryable status"
                        );

                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e @ MeshError::BreakerOpen { .. }) => return Err(e),
                Err(e) => {
                    if attempt < retry.retry_max {
                        // No response to consult: always exponential.
                        let delay = backoff::delay(
                            BackoffType::Exponential,
                            retry.retry_wait_min,
                            retry.retry_wait_max,
                            attempt,
                        );

                        warn!(
                            target = %target,
                            error = %e,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying after transport error"
                        );

                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(e);
                }
            }
        }
    }

    /// One attempt through the breaker-guarded transport.
    async fn round_trip(
        &self,
        target: &str,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        let breaker = self.breaker_for(target);
        let generation = breaker.before_request()?;

        match timeout(self.inner.cfg.http_timeout, self.inner.http.request(req)).await {
            Ok(Ok(resp)) => {
                // A ≥500 answer counts as a failure but still goes back to
                // the caller.
                let success = resp.status().as_u16() < 500;
                breaker.after_request(generation, success);
                if !success {
                    debug!(target = %target, status = resp.status().as_u16(), "upstream failure counted");
                }
                Ok(resp)
            }
            Ok(Err(e)) => {
                breaker.after_request(generation, false);
                Err(MeshError::UpstreamFailure(format!(
                    "request to {target} failed: {e}"
                )))
            }
            Err(_) => {
                breaker.after_request(generation, false);
                Err(MeshError::UpstreamFailure(format!(
                    "request to {target} timed out"
                )))
            }
        }
    }

    fn breaker_for(&self, target: &str) -> Arc<CircuitBreaker> {
        self.inner
            .breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(target, self.inner.cfg.breaker.clone()))
            })
            .clone()
    }
}

fn retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500..=599)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status() {
        assert!(retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable_status(StatusCode::SERVICE_UNAVAILABLE));

        assert!(!retryable_status(StatusCode::OK));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
        assert!(!retryable_status(StatusCode::CONFLICT));
    }

    #[test]
    fn test_breakers_are_per_target() {
        let client = ResilientClient::new(&ClientConfig::default());
        let a = client.breaker_for("a:8080");
        let b = client.breaker_for("b:8080");
        let a_again = client.breaker_for("a:8080");

        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
