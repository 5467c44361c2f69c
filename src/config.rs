//! Configuration for the mesh processes.
//!
//! Every process reads its configuration from environment variables at
//! startup. The variable layout matches what the deployer produces when it
//! flattens a manifest's sidecar section into container environment
//! (`client.retry.retry_max` becomes `CLIENT_RETRY_RETRY_MAX`).

use crate::error::{MeshError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| MeshError::InvalidConfig(format!("{key} is required")))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| MeshError::InvalidConfig(format!("{key}: invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => humantime::parse_duration(raw.trim())
            .map_err(|_| MeshError::InvalidConfig(format!("{key}: invalid duration {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Process-level timeouts shared by all three binaries.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Upper bound on in-flight request draining during graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Upper bound on full process teardown.
    pub terminate_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(2),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            shutdown_timeout: env_duration("APP_SHUTDOWN_TIMEOUT", Duration::from_secs(2))?,
            terminate_timeout: env_duration("APP_TERMINATE_TIMEOUT", Duration::from_secs(5))?,
        })
    }
}

/// Sidecar proxy configuration.
///
/// `SIDECAR_TARGET` and `SIDECAR_SERVICE_NAME` are required; the deployer
/// injects both when it creates the container pair.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Address of the co-located application (`<name>:8080`).
    pub target: String,
    /// Logical name of the co-located application instance.
    pub service_name: String,
    /// Port the sidecar listens on.
    pub port: u16,
    /// Bound on reading a request body.
    pub read_timeout: Duration,
    /// Bound on reading request headers.
    pub read_header_timeout: Duration,
    /// Base URL of the control plane.
    pub plane_url: String,
    /// TTL for cached discover results; zero disables the cache.
    pub discover_cache_ttl: Duration,
}

impl SidecarConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            target: env_required("SIDECAR_TARGET")?,
            service_name: env_required("SIDECAR_SERVICE_NAME")?,
            port: env_parse("SIDECAR_PORT", 8080)?,
            read_timeout: env_duration("SIDECAR_READ_TIMEOUT", Duration::from_secs(1))?,
            read_header_timeout: env_duration(
                "SIDECAR_READ_HEADER_TIMEOUT",
                Duration::from_secs(1),
            )?,
            plane_url: env_or("SIDECAR_PLANE_URL", "http://control-plane:8080"),
            discover_cache_ttl: env_duration("SIDECAR_DISCOVER_CACHE_TTL", Duration::ZERO)?,
        })
    }

    /// Host the co-located application uses to reach this sidecar.
    pub fn own_host(&self) -> String {
        format!("{}-sidecar:{}", self.service_name, self.port)
    }
}

/// Retry behavior of the outbound client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first.
    pub retry_max: u32,
    /// Lower clamp for backoff delays.
    pub retry_wait_min: Duration,
    /// Upper clamp for backoff delays.
    pub retry_wait_max: Duration,
    /// `exponential` or `linear`.
    pub backoff_type: BackoffType,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_max: 4,
            retry_wait_min: Duration::from_millis(200),
            retry_wait_max: Duration::from_secs(2),
            backoff_type: BackoffType::Exponential,
        }
    }
}

/// Backoff growth policy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffType {
    Exponential,
    Linear,
}

impl FromStr for BackoffType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(BackoffType::Exponential),
            "linear" => Ok(BackoffType::Linear),
            other => Err(format!("unknown backoff type: {other}")),
        }
    }
}

/// Circuit breaker thresholds, one breaker per outbound host.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Probes admitted while half-open.
    pub max_half_open_requests: u32,
    /// Length of a counting generation in the closed state; zero keeps one
    /// generation forever.
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Minimum settled requests in a generation before the breaker may trip.
    pub min_requests: u32,
    /// Consecutive failures that trip the breaker.
    pub consecutive_failures: u32,
    /// Failure ratio that trips the breaker.
    pub failure_rate: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_half_open_requests: 5,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            min_requests: 10,
            consecutive_failures: 5,
            failure_rate: 0.6,
        }
    }
}

/// Outbound HTTP client configuration: total per-attempt timeout plus the
/// retry and breaker layers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub http_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            http_timeout: env_duration("CLIENT_HTTP_TIMEOUT", Duration::from_secs(30))?,
            retry: RetryConfig {
                retry_max: env_parse("CLIENT_RETRY_RETRY_MAX", 4)?,
                retry_wait_min: env_duration(
                    "CLIENT_RETRY_RETRY_WAIT_MIN",
                    Duration::from_millis(200),
                )?,
                retry_wait_max: env_duration("CLIENT_RETRY_RETRY_WAIT_MAX", Duration::from_secs(2))?,
                backoff_type: env_parse(
                    "CLIENT_RETRY_BACKOFF_TYPE",
                    BackoffType::Exponential,
                )?,
            },
            breaker: BreakerConfig {
                max_half_open_requests: env_parse("CLIENT_CIRCUIT_BREAKER_MAX_HALF_OPEN_REQUESTS", 5)?,
                interval: env_duration("CLIENT_CIRCUIT_BREAKER_INTERVAL", Duration::from_secs(60))?,
                timeout: env_duration("CLIENT_CIRCUIT_BREAKER_TIMEOUT", Duration::from_secs(30))?,
                min_requests: env_parse("CLIENT_CIRCUIT_BREAKER_MIN_REQUESTS", 10)?,
                consecutive_failures: env_parse("CLIENT_CIRCUIT_BREAKER_CONSECUTIVE_FAILURES", 5)?,
                failure_rate: env_parse("CLIENT_CIRCUIT_BREAKER_FAILURE_RATE", 0.6)?,
            },
        })
    }
}

/// Which backend holds the rate-limit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStoreBackend {
    Memory,
    Redis,
}

impl FromStr for RateStoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(RateStoreBackend::Memory),
            "redis" => Ok(RateStoreBackend::Redis),
            other => Err(format!("unknown rate store backend: {other}")),
        }
    }
}

/// Sliding-window rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Optional limiter name mixed into the rate key.
    pub name: String,
    /// Maximum admissions per window and key.
    pub max_hits: u64,
    /// Window length.
    pub window: Duration,
    pub backend: RateStoreBackend,
    pub redis_url: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_hits: 10,
            window: Duration::from_secs(60),
            backend: RateStoreBackend::Memory,
            redis_url: String::new(),
        }
    }
}

impl RateLimiterConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            name: env_or("RATELIMITER_NAME", ""),
            max_hits: env_parse("RATELIMITER_MAX_HITS", 10)?,
            window: env_duration("RATELIMITER_WINDOW", Duration::from_secs(60))?,
            backend: env_parse("RATELIMITER_BACKEND", RateStoreBackend::Memory)?,
            redis_url: env_or("RATELIMITER_REDIS_URL", ""),
        })
    }
}

/// One liveness or readiness probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub url: String,
    pub period: Duration,
}

/// Prober configuration injected by the deployer.
#[derive(Debug, Clone, Default)]
pub struct ProbesConfig {
    /// Base URL of the deployer; empty disables reporting.
    pub deployer_url: String,
    /// Name of the probed application container.
    pub container_name: String,
    pub liveness: ProbeConfig,
    pub readiness: ProbeConfig,
}

impl ProbesConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            deployer_url: env_or("PROBES_DEPLOYER_URL", ""),
            container_name: env_or("PROBES_CONTAINER_NAME", ""),
            liveness: ProbeConfig {
                enabled: env_parse("PROBES_LIVENESS_ENABLED", false)?,
                url: env_or("PROBES_LIVENESS_URL", ""),
                period: env_duration("PROBES_LIVENESS_PERIOD", Duration::from_secs(60))?,
            },
            readiness: ProbeConfig {
                enabled: env_parse("PROBES_READINESS_ENABLED", false)?,
                url: env_or("PROBES_READINESS_URL", ""),
                period: env_duration("PROBES_READINESS_PERIOD", Duration::from_secs(60))?,
            },
        })
    }
}

/// Control-plane configuration.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub read_header_timeout: Duration,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(1),
            read_header_timeout: Duration::from_secs(1),
        }
    }
}

impl PlaneConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env_parse("PLANE_PORT", 8080)?,
            read_timeout: env_duration("PLANE_READ_TIMEOUT", Duration::from_secs(1))?,
            read_header_timeout: env_duration("PLANE_READ_HEADER_TIMEOUT", Duration::from_secs(1))?,
        })
    }
}

/// Deployer configuration.
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub read_header_timeout: Duration,
    /// Image used for every sidecar container.
    pub sidecar_image: String,
    /// Name of the shared mesh network.
    pub network: String,
    /// Control plane base URL used for instance registration.
    pub plane_url: String,
    /// Deployer base URL handed to probers.
    pub self_url: String,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(1),
            read_header_timeout: Duration::from_secs(1),
            sidecar_image: "meshkit/sidecar:latest".to_string(),
            network: "mesh_network".to_string(),
            plane_url: "http://control-plane:8080".to_string(),
            self_url: "http://deployer:8080".to_string(),
        }
    }
}

impl DeployerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            port: env_parse("DEPLOYER_PORT", defaults.port)?,
            read_timeout: env_duration("DEPLOYER_READ_TIMEOUT", defaults.read_timeout)?,
            read_header_timeout: env_duration(
                "DEPLOYER_READ_HEADER_TIMEOUT",
                defaults.read_header_timeout,
            )?,
            sidecar_image: env_or("DEPLOYER_SIDECAR_IMAGE", &defaults.sidecar_image),
            network: env_or("DEPLOYER_NETWORK", &defaults.network),
            plane_url: env_or("DEPLOYER_PLANE_URL", &defaults.plane_url),
            self_url: env_or("DEPLOYER_SELF_URL", &defaults.self_url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(cfg.terminate_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_client_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.http_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry.retry_max, 4);
        assert_eq!(cfg.retry.retry_wait_min, Duration::from_millis(200));
        assert_eq!(cfg.retry.backoff_type, BackoffType::Exponential);
        assert_eq!(cfg.breaker.min_requests, 10);
        assert_eq!(cfg.breaker.consecutive_failures, 5);
        assert!((cfg.breaker.failure_rate - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_type_parse() {
        assert_eq!(
            "exponential".parse::<BackoffType>().unwrap(),
            BackoffType::Exponential
        );
        assert_eq!("linear".parse::<BackoffType>().unwrap(), BackoffType::Linear);
        assert!("fibonacci".parse::<BackoffType>().is_err());
    }

    #[test]
    fn test_rate_store_backend_parse() {
        assert_eq!(
            "memory".parse::<RateStoreBackend>().unwrap(),
            RateStoreBackend::Memory
        );
        assert_eq!(
            "redis".parse::<RateStoreBackend>().unwrap(),
            RateStoreBackend::Redis
        );
        assert!("postgres".parse::<RateStoreBackend>().is_err());
    }

    #[test]
    fn test_sidecar_own_host() {
        let cfg = SidecarConfig {
            target: "counter:8080".into(),
            service_name: "counter".into(),
            port: 8080,
            read_timeout: Duration::from_secs(1),
            read_header_timeout: Duration::from_secs(1),
            plane_url: "http://control-plane:8080".into(),
            discover_cache_ttl: Duration::ZERO,
        };
        assert_eq!(cfg.own_host(), "counter-sidecar:8080");
    }

    #[test]
    fn test_sidecar_requires_target() {
        std::env::remove_var("SIDECAR_TARGET");
        assert!(SidecarConfig::from_env().is_err());
    }
}
