//! Periodic liveness and readiness probing.
//!
//! Lives inside every sidecar. Two independent tickers issue HTTP GETs
//! against the co-located application and POST the classified result to the
//! deployer as a [`ProbeReport`].

use crate::config::ProbesConfig;
use crate::error::{MeshError, Result};
use http::{header, Method, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Classified outcome of one probe execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
    /// Reserved for request construction failures.
    Unknown,
}

/// Which probe produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Liveness,
    Readiness,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Liveness => write!(f, "liveness"),
            ProbeKind::Readiness => write!(f, "readiness"),
        }
    }
}

/// Immutable probe result message sent to the deployer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub container_name: String,
    #[serde(rename = "probe_name")]
    pub probe: ProbeKind,
    pub status: ProbeStatus,
}

/// Periodic prober with independent liveness and readiness timers.
pub struct Prober {
    cfg: ProbesConfig,
    client: Client<HttpConnector, Full<Bytes>>,
    stop_signal: Arc<Notify>,
}

impl Prober {
    pub fn new(cfg: ProbesConfig) -> Self {
        Self {
            cfg,
            client: Client::builder(TokioExecutor::new()).build_http(),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    /// Stops the probe loops without touching the shared shutdown channel.
    ///
    /// A stop issued before [`Prober::run`] starts is remembered.
    pub fn stop(&self) {
        self.stop_signal.notify_one();
    }

    /// Runs both probe loops until the shutdown signal fires or
    /// [`Prober::stop`] is called.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            container = %self.cfg.container_name,
            liveness_enabled = self.cfg.liveness.enabled,
            readiness_enabled = self.cfg.readiness.enabled,
            "starting prober"
        );

        let mut liveness_ticker = interval(self.cfg.liveness.period.max(Duration::from_secs(1)));
        let mut readiness_ticker = interval(self.cfg.readiness.period.max(Duration::from_secs(1)));

        // Skip the immediate first tick of each timer.
        liveness_ticker.tick().await;
        readiness_ticker.tick().await;

        loop {
            tokio::select! {
                _ = liveness_ticker.tick() => {
                    if self.cfg.liveness.enabled {
                        self.probe_and_report(ProbeKind::Liveness, &self.cfg.liveness.url).await;
                    }
                }
                _ = readiness_ticker.tick() => {
                    if self.cfg.readiness.enabled {
                        self.probe_and_report(ProbeKind::Readiness, &self.cfg.readiness.url).await;
                    }
                }
                _ = self.stop_signal.notified() => {
                    info!("prober stopped");
                    return;
                }
                _ = shutdown_rx.recv() => {
                    info!("prober stopped");
                    return;
                }
            }
        }
    }

    async fn probe_and_report(&self, kind: ProbeKind, url: &str) {
        let status = self.execute_probe(url).await;

        let report = ProbeReport {
            container_name: self.cfg.container_name.clone(),
            probe: kind,
            status,
        };

        if let Err(e) = self.send_report(&report).await {
            error!("failed to send {} probe report: {}", kind, e);
        }
    }

    /// Issues the probe GET and classifies the outcome.
    async fn execute_probe(&self, url: &str) -> ProbeStatus {
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                error!("failed to build probe request for {:?}: {}", url, e);
                return ProbeStatus::Unknown;
            }
        };

        let mut req = Request::new(Full::new(Bytes::new()));
        *req.method_mut() = Method::GET;
        *req.uri_mut() = uri;

        match timeout(PROBE_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(resp)) => {
                let code = resp.status().as_u16();
                if (200..400).contains(&code) {
                    ProbeStatus::Healthy
                } else {
                    ProbeStatus::Unhealthy
                }
            }
            Ok(Err(e)) => {
                debug!("probe request failed: {}", e);
                ProbeStatus::Unhealthy
            }
            Err(_) => {
                debug!("probe request timed out");
                ProbeStatus::Unhealthy
            }
        }
    }

    async fn send_report(&self, report: &ProbeReport) -> Result<()> {
        if self.cfg.deployer_url.is_empty() {
            debug!("deployer url not configured, skipping report");
            return Ok(());
        }

        let body = serde_json::to_vec(report)
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to marshal report: {e}")))?;

        let uri: Uri = format!("{}/probe-report", self.cfg.deployer_url)
            .parse()
            .map_err(|e| MeshError::UpstreamFailure(format!("invalid deployer url: {e}")))?;

        let mut req = Request::new(Full::new(Bytes::from(body)));
        *req.method_mut() = Method::POST;
        *req.uri_mut() = uri;
        req.headers_mut().insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        let resp = timeout(PROBE_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| MeshError::UpstreamFailure("report request timed out".to_string()))?
            .map_err(|e| MeshError::UpstreamFailure(format!("failed to send report: {e}")))?;

        if resp.status() != StatusCode::OK && resp.status() != StatusCode::ACCEPTED {
            return Err(MeshError::InvalidStatusCode(resp.status().as_u16()));
        }

        Ok(())
    }
}
