//! Sliding-window rate limiting over a pluggable record store.
//!
//! The limiter wraps the whole sidecar handler. Requests to the metrics
//! endpoint bypass it unconditionally; everything else is admitted against
//! a moving window per `ratelimiter:<path>[:<name>]:<client_ip>` key.
//!
//! The window check and the record insert are two separate store
//! operations, so with `P` concurrent requests on one key the window can
//! overshoot by at most `P - 1` admissions.

pub mod redis;
pub mod store;

use crate::config::RateLimiterConfig;
use crate::error::{MeshError, Result};
use crate::listener::{client_ip, full_body, HandlerBody};
use crate::metrics::Metrics;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use store::RateStore;
use tower::Service;
use tracing::{debug, error};

/// Builds the rate key for a request.
fn rate_key(path: &str, name: &str, ip: &str) -> String {
    if name.is_empty() {
        format!("ratelimiter:{path}:{ip}")
    } else {
        format!("ratelimiter:{path}:{name}:{ip}")
    }
}

fn unix_nanos(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Runs the admission sequence for one key: prune, count, record, refresh.
///
/// Fails with [`MeshError::RateLimited`] when the window is exhausted;
/// store failures bubble up unchanged.
pub async fn admit(
    store: &dyn RateStore,
    key: &str,
    max_hits: u64,
    window: Duration,
    now: SystemTime,
) -> Result<()> {
    let now_nanos = unix_nanos(now);
    let window_start = now_nanos - window.as_nanos() as i64;

    store.remove_old_records(key, 0, window_start).await?;

    let count = store.count_records(key).await?;
    if count >= max_hits {
        return Err(MeshError::RateLimited);
    }

    store.add_record(key, now_nanos).await?;
    store.expire_key(key, window).await?;

    Ok(())
}

/// Sliding-window limiter wrapping another handler.
pub struct RateLimit<S> {
    inner: S,
    store: Arc<dyn RateStore>,
    name: Arc<str>,
    max_hits: u64,
    window: Duration,
    metrics: Arc<Metrics>,
}

impl<S> RateLimit<S> {
    pub fn new(
        inner: S,
        store: Arc<dyn RateStore>,
        cfg: &RateLimiterConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner,
            store,
            name: cfg.name.as_str().into(),
            max_hits: cfg.max_hits,
            window: cfg.window,
            metrics,
        }
    }

    fn reject(&self, status: StatusCode, message: &str) -> Response<HandlerBody> {
        self.metrics.inc_total_requests(status.as_u16());
        Response::builder()
            .status(status)
            .body(full_body(message.to_string()))
            .unwrap_or_else(|_| Response::new(full_body("")))
    }
}

impl<S: Clone> Clone for RateLimit<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            store: Arc::clone(&self.store),
            name: Arc::clone(&self.name),
            max_hits: self.max_hits,
            window: self.window,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<S> Service<Request<Incoming>> for RateLimit<S>
where
    S: Service<Request<Incoming>, Response = Response<HandlerBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
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
        if req.uri().path() == "/metrics" {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(req).await });
        }

        let this = self.clone();
        Box::pin(async move {
            let mut inner = this.inner.clone();
            let key = rate_key(req.uri().path(), &this.name, &client_ip(&req));

            match admit(
                this.store.as_ref(),
                &key,
                this.max_hits,
                this.window,
                SystemTime::now(),
            )
            .await
            {
                Ok(()) => inner.call(req).await,
                Err(MeshError::RateLimited) => {
                    debug!(key = %key, "rate limit exceeded");
                    Ok(this.reject(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"))
                }
                Err(e) => {
                    error!("rate limit store error: {}", e);
                    Ok(this.reject(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal Server Error",
                    ))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::store::InMemoryStore;
    use super::*;
    use async_trait::async_trait;

    /// Store double that fails a chosen operation.
    #[derive(Default)]
    struct FlakyStore {
        fail_remove: bool,
        fail_count: bool,
        fail_add: bool,
        fail_expire: bool,
        count: u64,
    }

    fn store_err() -> MeshError {
        MeshError::RuntimeFailure("db error".into())
    }

    #[async_trait]
    impl RateStore for FlakyStore {
        async fn remove_old_records(&self, _key: &str, _from: i64, _to: i64) -> Result<()> {
            if self.fail_remove {
                return Err(store_err());
            }
            Ok(())
        }

        async fn count_records(&self, _key: &str) -> Result<u64> {
            if self.fail_count {
                return Err(store_err());
            }
            Ok(self.count)
        }

        async fn add_record(&self, _key: &str, _at: i64) -> Result<()> {
            if self.fail_add {
                return Err(store_err());
            }
            Ok(())
        }

        async fn expire_key(&self, _key: &str, _ttl: Duration) -> Result<()> {
            if self.fail_expire {
                return Err(store_err());
            }
            Ok(())
        }
    }

    #[test]
    fn test_rate_key() {
        assert_eq!(rate_key("/t", "", "1.2.3.4"), "ratelimiter:/t:1.2.3.4");
        assert_eq!(
            rate_key("/t", "edge", "1.2.3.4"),
            "ratelimiter:/t:edge:1.2.3.4"
        );
    }

    #[tokio::test]
    async fn test_admit_below_limit() {
        let store = FlakyStore {
            count: 4,
            ..Default::default()
        };
        assert!(admit(&store, "k", 5, Duration::from_secs(60), SystemTime::now())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_admit_at_limit() {
        let store = FlakyStore {
            count: 5,
            ..Default::default()
        };
        let err = admit(&store, "k", 5, Duration::from_secs(60), SystemTime::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RateLimited));
    }

    #[tokio::test]
    async fn test_admit_store_errors_bubble() {
        for store in [
            FlakyStore {
                fail_remove: true,
                ..Default::default()
            },
            FlakyStore {
                fail_count: true,
                ..Default::default()
            },
            FlakyStore {
                fail_add: true,
                ..Default::default()
            },
            FlakyStore {
                fail_expire: true,
                ..Default::default()
            },
        ] {
            let err = admit(&store, "k", 5, Duration::from_secs(60), SystemTime::now())
                .await
                .unwrap_err();
            assert!(matches!(err, MeshError::RuntimeFailure(_)));
        }
    }

    #[tokio::test]
    async fn test_admit_window_slides() {
        let store = InMemoryStore::new();
        let window = Duration::from_secs(1);
        let start = SystemTime::now();

        for _ in 0..5 {
            assert!(admit(&store, "k", 5, window, start).await.is_ok());
        }
        assert!(matches!(
            admit(&store, "k", 5, window, start).await.unwrap_err(),
            MeshError::RateLimited
        ));

        // Same key, one window later: old records are pruned away.
        let later = start + Duration::from_millis(1200);
        assert!(admit(&store, "k", 5, window, later).await.is_ok());
    }
}
