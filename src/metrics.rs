//! Prometheus metrics for the proxy surfaces.
//!
//! Every process owns one `Metrics` instance and passes it around by
//! handle. Metric names are prefixed with the service name so that scrapes
//! from different sidecars stay distinguishable.

use crate::error::{MeshError, Result};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for the per-status request counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    /// HTTP status code of the outcome.
    pub code: String,
}

/// Request counter and duration histogram for one process.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<StatusLabels, Counter>,
    response_duration_seconds: Histogram,
}

impl Metrics {
    /// Creates a metrics set prefixed with the given service name.
    pub fn new(service: &str) -> Self {
        let prefix = sanitize(service);
        let mut registry = Registry::default();

        let requests_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            format!("{prefix}_http_requests"),
            "Total number of HTTP requests handled",
            requests_total.clone(),
        );

        // Buckets: 5ms up to ~10s.
        let response_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            format!("{prefix}_http_response_duration_seconds"),
            "Histogram of response durations for handled requests",
            response_duration_seconds.clone(),
        );

        Self {
            registry,
            requests_total,
            response_duration_seconds,
        }
    }

    /// Observes a wall-clock request duration in seconds.
    pub fn observe_duration(&self, seconds: f64) {
        self.response_duration_seconds.observe(seconds);
    }

    /// Increments the outcome counter for the given status code.
    pub fn inc_total_requests(&self, code: u16) {
        self.requests_total
            .get_or_create(&StatusLabels {
                code: code.to_string(),
            })
            .inc();
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| MeshError::RuntimeFailure(format!("metrics encoding: {e}")))?;
        Ok(buffer)
    }
}

/// Container names carry hyphens, which are invalid in metric names.
fn sanitize(service: &str) -> String {
    service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_requests() {
        let metrics = Metrics::new("counter");
        metrics.inc_total_requests(200);
        metrics.inc_total_requests(200);
        metrics.inc_total_requests(502);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("counter_http_requests_total"));
        assert!(encoded.contains("code=\"200\""));
        assert!(encoded.contains("code=\"502\""));
    }

    #[test]
    fn test_observe_duration() {
        let metrics = Metrics::new("counter");
        metrics.observe_duration(0.05);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("counter_http_response_duration_seconds"));
    }

    #[test]
    fn test_hyphenated_service_name() {
        let metrics = Metrics::new("counter-1");
        metrics.inc_total_requests(200);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("counter_1_http_requests_total"));
    }
}
