//! Deployer control loop and HTTP surface.
//!
//! Applies `Service` manifests by creating one (application, sidecar)
//! container pair per replica on the mesh network, registering each pair
//! with the control plane and tracking it for health reconciliation. A
//! replica failure rolls back every container the apply created.

use crate::config::DeployerConfig;
use crate::error::{MeshError, Result};
use crate::health::HealthReconciler;
use crate::listener::{full_body, HandlerBody};
use crate::manifest::{flatten_env, Manifest};
use crate::prober::ProbeReport;
use crate::runtime::{ContainerRuntime, ContainerSpec};
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
use tracing::{error, info, warn};

const PROJECT: &str = "meshkit";
const PROMETHEUS_IMAGE: &str = "prom/prometheus:latest";
const GRAFANA_IMAGE: &str = "grafana/grafana:latest";

/// Lifecycle status of one deployed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Initializing,
    Running,
    NotReady,
    Failed,
    Stopping,
    Stopped,
    Removing,
}

/// One deployed (application, sidecar) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub service_name: String,
    pub status: InstanceStatus,
    pub container_id: String,
    pub sidecar_id: String,
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    services: Vec<ContainerInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitoringRequest {
    #[serde(default)]
    prometheus_config: Option<String>,
    #[serde(default)]
    grafana_user: Option<String>,
    #[serde(default)]
    grafana_password: Option<String>,
}

#[derive(Debug, Serialize)]
struct MonitoringResponse {
    prometheus_id: String,
    grafana_id: String,
    prometheus_port: u16,
    grafana_port: u16,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ServiceActionRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct ServiceActionResponse {
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct NetworkRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct NetworkResponse {
    network_id: String,
    name: String,
    status: String,
}

/// Deployer HTTP service.
#[derive(Clone)]
pub struct Deployer {
    inner: Arc<DeployerShared>,
}

struct DeployerShared {
    cfg: DeployerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    containers: Arc<Mutex<HashMap<String, ContainerInfo>>>,
    services: Mutex<HashMap<String, Vec<String>>>,
    reconciler: Arc<HealthReconciler>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Deployer {
    pub fn new(
        cfg: DeployerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        containers: Arc<Mutex<HashMap<String, ContainerInfo>>>,
        reconciler: Arc<HealthReconciler>,
    ) -> Self {
        Self {
            inner: Arc::new(DeployerShared {
                cfg,
                runtime,
                containers,
                services: Mutex::new(HashMap::new()),
                reconciler,
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
        }
    }

    async fn handle(self, req: Request<Incoming>) -> Response<HandlerBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::POST && path == "/apply" {
            self.apply_handler(req).await
        } else if method == Method::POST && path == "/monitoring" {
            self.monitoring_handler(req).await
        } else if method == Method::GET && path == "/containers" {
            self.list_containers()
        } else if method == Method::POST && path == "/containers/stop" {
            self.stop_handler(req).await
        } else if method == Method::POST && path == "/containers/remove" {
            self.remove_handler(req).await
        } else if method == Method::POST && path == "/network" {
            self.network_handler(req).await
        } else if method == Method::GET && path == "/health" {
            json_response(StatusCode::OK, &HashMap::from([("status", "healthy")]))
        } else if method == Method::POST && path == "/probe-report" {
            self.probe_report_handler(req).await
        } else if method == Method::GET && path == "/health-states" {
            json_response(StatusCode::OK, &self.inner.reconciler.states_snapshot())
        } else {
            error_response(StatusCode::NOT_FOUND, "not found", None)
        }
    }

    async fn apply_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                    Some(&e.to_string()),
                )
            }
        };

        let manifest: Manifest = match serde_yaml::from_slice(&body) {
            Ok(m) => m,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid YAML manifest",
                    Some(&e.to_string()),
                )
            }
        };

        if manifest.metadata.name.is_empty() || manifest.spec.image.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "name and image are required", None);
        }
        if manifest.spec.replicas < 1 {
            return error_response(StatusCode::BAD_REQUEST, "replicas must be at least 1", None);
        }

        match self.deploy(&manifest).await {
            Ok(services) => json_response(StatusCode::CREATED, &DeployResponse { services }),
            Err(e) => error_response(e.status(), &e.to_string(), None),
        }
    }

    /// Deploys every replica of a manifest.
    ///
    /// The instance maps are committed only after all replicas exist, so a
    /// failed apply leaves no trace: every container it created is removed
    /// and no service entry survives.
    async fn deploy(&self, manifest: &Manifest) -> Result<Vec<ContainerInfo>> {
        let runtime = &self.inner.runtime;
        let cfg = &self.inner.cfg;

        runtime.create_network(&cfg.network).await?;

        if !runtime.image_exists(&cfg.sidecar_image).await {
            runtime.pull_image(&cfg.sidecar_image).await.map_err(|e| {
                MeshError::RuntimeFailure(format!("failed to pull sidecar image: {e}"))
            })?;
        }

        if !runtime.image_exists(&manifest.spec.image).await {
            runtime
                .pull_image(&manifest.spec.image)
                .await
                .map_err(|e| MeshError::InvalidRequest(format!("no image found: {e}")))?;
        }

        let mut created = Vec::with_capacity(manifest.spec.replicas as usize);
        for idx in 1..=manifest.spec.replicas {
            match self.deploy_replica(manifest, idx).await {
                Ok(info) => created.push(info),
                Err(e) => {
                    self.clean_replicas(&manifest.metadata.name, idx).await;
                    return Err(MeshError::RuntimeFailure(format!(
                        "failed to deploy service replica {idx}: {e}"
                    )));
                }
            }
        }

        let mut containers = self.inner.containers.lock();
        let mut services = self.inner.services.lock();
        for info in &created {
            containers.insert(info.name.clone(), info.clone());
            services
                .entry(info.service_name.clone())
                .or_default()
                .push(info.name.clone());
        }

        Ok(created)
    }

    async fn deploy_replica(&self, manifest: &Manifest, idx: u32) -> Result<ContainerInfo> {
        let cfg = &self.inner.cfg;
        let container_name = format!("{}-{}", manifest.metadata.name, idx);
        let sidecar_name = format!("{container_name}-sidecar");

        let mut sidecar_env = manifest
            .spec
            .sidecar
            .as_ref()
            .map(flatten_env)
            .unwrap_or_default();
        sidecar_env.push(format!("SIDECAR_TARGET={container_name}:8080"));
        sidecar_env.push(format!("SIDECAR_SERVICE_NAME={container_name}"));
        sidecar_env.extend(probe_env(&cfg.self_url, manifest, &container_name));

        let sidecar_id = self
            .inner
            .runtime
            .create_and_start(ContainerSpec {
                name: sidecar_name.clone(),
                image: cfg.sidecar_image.clone(),
                env: sidecar_env,
                network: cfg.network.clone(),
                labels: project_labels(&sidecar_name),
                ..Default::default()
            })
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to create sidecar: {e}")))?;

        let app_env = vec![
            format!("HTTP_PROXY=http://{sidecar_name}:8080"),
            format!("HTTPS_PROXY=http://{sidecar_name}:8080"),
            format!("SERVICE_NAME={container_name}"),
        ];

        let container_id = self
            .inner
            .runtime
            .create_and_start(ContainerSpec {
                name: container_name.clone(),
                image: manifest.spec.image.clone(),
                env: app_env,
                network: cfg.network.clone(),
                labels: project_labels(&container_name),
                ..Default::default()
            })
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to create app: {e}")))?;

        if let Err(e) = self
            .register_instance(&manifest.metadata.name, &sidecar_name)
            .await
        {
            warn!("failed to register service with control plane: {}", e);
        }

        Ok(ContainerInfo {
            name: container_name,
            service_name: manifest.metadata.name.clone(),
            status: InstanceStatus::Initializing,
            container_id,
            sidecar_id,
        })
    }

    /// Force-removes every container pair of replicas `1..=upto`, including
    /// a partially created pair. Removal errors are ignored.
    async fn clean_replicas(&self, name: &str, upto: u32) {
        for idx in 1..=upto {
            let container_name = format!("{name}-{idx}");
            let _ = self
                .inner
                .runtime
                .remove_container(&container_name, true)
                .await;
            let _ = self
                .inner
                .runtime
                .remove_container(&format!("{container_name}-sidecar"), true)
                .await;
        }
    }

    async fn register_instance(&self, name: &str, sidecar_name: &str) -> Result<()> {
        let uri: Uri = format!("{}/register", self.inner.cfg.plane_url)
            .parse()
            .map_err(|e| MeshError::UpstreamFailure(format!("invalid plane url: {e}")))?;

        let body = serde_json::json!({
            "name": name,
            "address": format!("{sidecar_name}:8080"),
        });

        let mut req = Request::new(Full::new(Bytes::from(body.to_string())));
        *req.method_mut() = Method::POST;
        *req.uri_mut() = uri;
        req.headers_mut().insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        let resp = self
            .inner
            .client
            .request(req)
            .await
            .map_err(|e| MeshError::UpstreamFailure(format!("failed to register service: {e}")))?;

        if resp.status() != StatusCode::OK {
            return Err(MeshError::InvalidStatusCode(resp.status().as_u16()));
        }

        Ok(())
    }

    async fn monitoring_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                    Some(&e.to_string()),
                )
            }
        };

        let request: MonitoringRequest = if body.is_empty() {
            MonitoringRequest::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid request body",
                        Some(&e.to_string()),
                    )
                }
            }
        };

        match self.deploy_monitoring(request).await {
            Ok(resp) => json_response(StatusCode::CREATED, &resp),
            Err(e) => error_response(e.status(), &e.to_string(), None),
        }
    }

    async fn deploy_monitoring(&self, request: MonitoringRequest) -> Result<MonitoringResponse> {
        let runtime = &self.inner.runtime;
        let cfg = &self.inner.cfg;

        runtime.create_network(&cfg.network).await?;

        if let Err(e) = runtime.pull_image(PROMETHEUS_IMAGE).await {
            warn!("failed to pull prometheus image: {}", e);
        }
        if let Err(e) = runtime.pull_image(GRAFANA_IMAGE).await {
            warn!("failed to pull grafana image: {}", e);
        }

        let mut prometheus_volumes = Vec::new();
        if let Some(config) = request.prometheus_config.filter(|c| !c.is_empty()) {
            prometheus_volumes.push((config, "/etc/prometheus/prometheus.yml".to_string()));
        }

        let prometheus_id = runtime
            .create_and_start(ContainerSpec {
                name: "prometheus".to_string(),
                image: PROMETHEUS_IMAGE.to_string(),
                network: cfg.network.clone(),
                labels: project_labels("prometheus"),
                ports: vec![(9090, 9090)],
                volumes: prometheus_volumes,
                ..Default::default()
            })
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to create prometheus: {e}")))?;

        let grafana_user = request.grafana_user.unwrap_or_default();
        let grafana_user = if grafana_user.is_empty() {
            "admin".to_string()
        } else {
            grafana_user
        };
        let grafana_password = request.grafana_password.unwrap_or_default();
        let grafana_password = if grafana_password.is_empty() {
            "admin".to_string()
        } else {
            grafana_password
        };

        let grafana_id = runtime
            .create_and_start(ContainerSpec {
                name: "grafana".to_string(),
                image: GRAFANA_IMAGE.to_string(),
                env: vec![
                    format!("GF_SECURITY_ADMIN_USER={grafana_user}"),
                    format!("GF_SECURITY_ADMIN_PASSWORD={grafana_password}"),
                ],
                network: cfg.network.clone(),
                labels: project_labels("grafana"),
                ports: vec![(3000, 3000)],
                volumes: vec![("grafana-storage".to_string(), "/var/lib/grafana".to_string())],
                ..Default::default()
            })
            .await
            .map_err(|e| MeshError::RuntimeFailure(format!("failed to create grafana: {e}")))?;

        Ok(MonitoringResponse {
            prometheus_id,
            grafana_id,
            prometheus_port: 9090,
            grafana_port: 3000,
            status: "running".to_string(),
        })
    }

    fn list_containers(&self) -> Response<HandlerBody> {
        let containers = self.inner.containers.lock().clone();
        json_response(StatusCode::OK, &containers)
    }

    async fn stop_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let request = match parse_json::<ServiceActionRequest>(req).await {
            Ok(r) => r,
            Err(resp) => return *resp,
        };

        if request.name.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "name is required", None);
        }

        let Some(instances) = self.service_instances(&request.name) else {
            return error_response(StatusCode::NOT_FOUND, "service not found", None);
        };

        for instance in instances {
            let Some(info) = self.set_status(&instance, InstanceStatus::Stopping) else {
                continue;
            };

            if let Err(e) = self.inner.runtime.stop_container(&info.container_id).await {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to stop container",
                    Some(&e.to_string()),
                );
            }
            if let Err(e) = self.inner.runtime.stop_container(&info.sidecar_id).await {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to stop sidecar",
                    Some(&e.to_string()),
                );
            }

            self.set_status(&instance, InstanceStatus::Stopped);
        }

        json_response(
            StatusCode::OK,
            &ServiceActionResponse {
                name: request.name,
                status: "stopped".to_string(),
            },
        )
    }

    async fn remove_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let request = match parse_json::<ServiceActionRequest>(req).await {
            Ok(r) => r,
            Err(resp) => return *resp,
        };

        if request.name.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "name is required", None);
        }

        let Some(instances) = self.service_instances(&request.name) else {
            return error_response(StatusCode::NOT_FOUND, "service not found", None);
        };

        for instance in &instances {
            let Some(info) = self.set_status(instance, InstanceStatus::Removing) else {
                continue;
            };

            if let Err(e) = self
                .inner
                .runtime
                .remove_container(&info.container_id, true)
                .await
            {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to remove container",
                    Some(&e.to_string()),
                );
            }
            if let Err(e) = self
                .inner
                .runtime
                .remove_container(&info.sidecar_id, true)
                .await
            {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to remove sidecar",
                    Some(&e.to_string()),
                );
            }

            self.inner.containers.lock().remove(instance);
        }

        self.inner.services.lock().remove(&request.name);

        json_response(
            StatusCode::OK,
            &ServiceActionResponse {
                name: request.name,
                status: "removed".to_string(),
            },
        )
    }

    async fn network_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let request = match parse_json::<NetworkRequest>(req).await {
            Ok(r) => r,
            Err(resp) => return *resp,
        };

        let name = if request.name.is_empty() {
            self.inner.cfg.network.clone()
        } else {
            request.name
        };

        match self.inner.runtime.create_network(&name).await {
            Ok(network_id) => json_response(
                StatusCode::CREATED,
                &NetworkResponse {
                    network_id,
                    name,
                    status: "created".to_string(),
                },
            ),
            Err(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to create network",
                Some(&e.to_string()),
            ),
        }
    }

    async fn probe_report_handler(&self, req: Request<Incoming>) -> Response<HandlerBody> {
        let report = match parse_json::<ProbeReport>(req).await {
            Ok(r) => r,
            Err(resp) => return *resp,
        };

        info!(
            container = %report.container_name,
            probe = %report.probe,
            status = ?report.status,
            "received probe report"
        );

        self.inner.reconciler.handle_report(&report);

        Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(full_body(""))
            .unwrap_or_else(|_| Response::new(full_body("")))
    }

    fn service_instances(&self, name: &str) -> Option<Vec<String>> {
        self.inner.services.lock().get(name).cloned()
    }

    /// Updates an instance's status, returning a snapshot of its info.
    fn set_status(&self, name: &str, status: InstanceStatus) -> Option<ContainerInfo> {
        let mut containers = self.inner.containers.lock();
        let info = containers.get_mut(name)?;
        info.status = status;
        Some(info.clone())
    }
}

impl Service<Request<Incoming>> for Deployer {
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

/// Probe environment for a sidecar: reporting endpoint plus one block per
/// configured probe.
fn probe_env(self_url: &str, manifest: &Manifest, container_name: &str) -> Vec<String> {
    let mut env = vec![
        format!("PROBES_DEPLOYER_URL={self_url}"),
        format!("PROBES_CONTAINER_NAME={container_name}"),
    ];

    if let Some(probe) = &manifest.spec.liveness_probe {
        let probe = probe.with_defaults();
        if let Some(http_get) = &probe.http_get {
            env.push("PROBES_LIVENESS_ENABLED=true".to_string());
            env.push(format!(
                "PROBES_LIVENESS_URL=http://{container_name}:{}{}",
                http_get.port, http_get.path
            ));
            env.push(format!("PROBES_LIVENESS_PERIOD={}s", probe.period_seconds));
        }
    }

    if let Some(probe) = &manifest.spec.readiness_probe {
        let probe = probe.with_defaults();
        if let Some(http_get) = &probe.http_get {
            env.push("PROBES_READINESS_ENABLED=true".to_string());
            env.push(format!(
                "PROBES_READINESS_URL=http://{container_name}:{}{}",
                http_get.port, http_get.path
            ));
            env.push(format!("PROBES_READINESS_PERIOD={}s", probe.period_seconds));
        }
    }

    env
}

fn project_labels(service: &str) -> Vec<(String, String)> {
    vec![
        ("com.docker.compose.project".to_string(), PROJECT.to_string()),
        ("com.docker.compose.service".to_string(), service.to_string()),
    ]
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> std::result::Result<T, Box<Response<HandlerBody>>> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| {
            Box::new(error_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
                Some(&e.to_string()),
            ))
        })?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| {
        Box::new(error_response(
            StatusCode::BAD_REQUEST,
            "invalid request body",
            Some(&e.to_string()),
        ))
    })
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<HandlerBody> {
    match serde_json::to_vec(data) {
        Ok(body) => Response::builder()
            .status(status)
            .header(
                header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            )
            .body(full_body(body))
            .unwrap_or_else(|_| Response::new(full_body(""))),
        Err(e) => {
            error!("failed to encode response: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failure", None)
        }
    }
}

/// JSON `{error, details?}` envelope used by every deployer endpoint.
fn error_response(status: StatusCode, message: &str, details: Option<&str>) -> Response<HandlerBody> {
    error!(status = status.as_u16(), details = ?details, "{}", message);

    let mut envelope = HashMap::from([("error", message.to_string())]);
    if let Some(details) = details {
        envelope.insert("details", details.to_string());
    }

    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        )
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body("")))
}
