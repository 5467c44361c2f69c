//! YAML service manifests and environment-variable flattening.

use serde::Deserialize;
use std::collections::BTreeMap;

/// A `kind: Service` deployment manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: Metadata,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Arbitrarily nested sidecar configuration, flattened into container
    /// environment at deploy time.
    #[serde(default)]
    pub sidecar: Option<serde_yaml::Value>,
    #[serde(rename = "livenessProbe", default)]
    pub liveness_probe: Option<Probe>,
    #[serde(rename = "readinessProbe", default)]
    pub readiness_probe: Option<Probe>,
}

/// A health check probe definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Probe {
    #[serde(rename = "httpGet", default)]
    pub http_get: Option<HttpGetAction>,
    #[serde(rename = "initialDelaySeconds", default)]
    pub initial_delay_seconds: u32,
    #[serde(rename = "periodSeconds", default)]
    pub period_seconds: u32,
    #[serde(rename = "timeoutSeconds", default)]
    pub timeout_seconds: u32,
    #[serde(rename = "failureThreshold", default)]
    pub failure_threshold: u32,
    #[serde(rename = "successThreshold", default)]
    pub success_threshold: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpGetAction {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub scheme: String,
}

impl Probe {
    /// Fills in the defaulted fields: period 60s, timeout 5s,
    /// failureThreshold 3, successThreshold 1, port 8080, scheme http.
    pub fn with_defaults(&self) -> Probe {
        let mut probe = self.clone();
        if probe.period_seconds == 0 {
            probe.period_seconds = 60;
        }
        if probe.timeout_seconds == 0 {
            probe.timeout_seconds = 5;
        }
        if probe.failure_threshold == 0 {
            probe.failure_threshold = 3;
        }
        if probe.success_threshold == 0 {
            probe.success_threshold = 1;
        }
        if let Some(http_get) = probe.http_get.as_mut() {
            if http_get.port == 0 {
                http_get.port = 8080;
            }
            if http_get.scheme.is_empty() {
                http_get.scheme = "http".to_string();
            }
        }
        probe
    }
}

/// Flattens a nested mapping into sorted `KEY=value` environment pairs.
///
/// Keys along the path are joined with `_` and upper-cased; hyphens, dots
/// and interior upper-case boundaries all become `_`. Scalars are
/// stringified, sequences become comma-joined strings.
pub fn flatten_env(value: &serde_yaml::Value) -> Vec<String> {
    let mut flat = BTreeMap::new();
    flatten_into(value, "", &mut flat);

    flat.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn flatten_into(value: &serde_yaml::Value, prefix: &str, out: &mut BTreeMap<String, String>) {
    match value {
        serde_yaml::Value::Mapping(mapping) => {
            for (key, nested) in mapping {
                let Some(key) = key.as_str() else { continue };
                let full_key = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{prefix}_{key}")
                };
                flatten_into(nested, &full_key, out);
            }
        }
        serde_yaml::Value::Sequence(items) => {
            let joined = items
                .iter()
                .map(scalar_to_string)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(to_env_key(prefix), joined);
        }
        other => {
            if !prefix.is_empty() {
                out.insert(to_env_key(prefix), scalar_to_string(other));
            }
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// `retry-max.limit` -> `RETRY_MAX_LIMIT`; an interior upper-case letter
/// also starts a new segment (`maxHits` -> `MAX_HITS`).
fn to_env_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len());
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            result.push('_');
        }
        if c == '-' || c == '.' {
            result.push('_');
        } else {
            result.push(c);
        }
    }

    result.to_uppercase()
}
