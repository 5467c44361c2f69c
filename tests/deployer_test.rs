use async_trait::async_trait;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use meshkit::config::DeployerConfig;
use meshkit::deployer::{ContainerInfo, Deployer};
use meshkit::error::{MeshError, Result};
use meshkit::health::HealthReconciler;
use meshkit::listener::HttpListener;
use meshkit::runtime::{ContainerRuntime, ContainerSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeState {
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    restarted: Vec<String>,
    create_calls: usize,
    /// 1-based create call that fails.
    fail_create_at: Option<usize>,
}

#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_network(&self, name: &str) -> Result<String> {
        Ok(name.to_string())
    }

    async fn image_exists(&self, _image: &str) -> bool {
        true
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String> {
        let mut state = self.state.lock();
        state.create_calls += 1;

        if state.fail_create_at == Some(state.create_calls) {
            return Err(MeshError::RuntimeFailure("container create failed".into()));
        }

        let id = format!("id-{}", state.create_calls);
        state.created.push(spec);
        Ok(id)
    }

    async fn stop_container(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<()> {
        self.state.lock().removed.push(name.to_string());
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.state.lock().restarted.push(name.to_string());
        Ok(())
    }
}

struct TestDeployer {
    addr: std::net::SocketAddr,
    runtime: Arc<FakeRuntime>,
    reconciler: Arc<HealthReconciler>,
    _shutdown_tx: broadcast::Sender<()>,
}

async fn start_deployer(fail_create_at: Option<usize>) -> TestDeployer {
    let runtime = Arc::new(FakeRuntime {
        state: Mutex::new(FakeState {
            fail_create_at,
            ..Default::default()
        }),
    });

    let containers = Arc::new(Mutex::new(HashMap::<String, ContainerInfo>::new()));
    let reconciler = Arc::new(HealthReconciler::new(
        Arc::clone(&containers),
        runtime.clone() as Arc<dyn ContainerRuntime>,
    ));

    let cfg = DeployerConfig {
        // Unroutable plane: registration fails fast and is only logged.
        plane_url: "http://127.0.0.1:1".to_string(),
        ..Default::default()
    };

    let deployer = Deployer::new(
        cfg,
        runtime.clone() as Arc<dyn ContainerRuntime>,
        containers,
        Arc::clone(&reconciler),
    );

    let listener = HttpListener::bind("127.0.0.1:0", deployer, Duration::from_secs(1))
        .await
        .unwrap();
    let addr = listener.local_addr();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    TestDeployer {
        addr,
        runtime,
        reconciler,
        _shutdown_tx: shutdown_tx,
    }
}

fn http_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn post(
    addr: std::net::SocketAddr,
    path: &str,
    body: &str,
) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);

    (status, value)
}

async fn get(addr: std::net::SocketAddr, path: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .uri(format!("http://{addr}{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);

    (status, value)
}

const MANIFEST: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: counter
spec:
  image: meshkit/counter:latest
  replicas: 2
  sidecar:
    ratelimiter:
      max_hits: 100
  livenessProbe:
    httpGet:
      path: /healthz
    periodSeconds: 10
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_apply_creates_replica_pairs() {
    let deployer = start_deployer(None).await;

    let (status, body) = post(deployer.addr, "/apply", MANIFEST).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["services"].as_array().unwrap().len(), 2);

    let state = deployer.runtime.state.lock();
    let names: Vec<&str> = state.created.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["counter-1-sidecar", "counter-1", "counter-2-sidecar", "counter-2"]
    );

    let sidecar = &state.created[0];
    assert!(sidecar.env.contains(&"SIDECAR_TARGET=counter-1:8080".to_string()));
    assert!(sidecar.env.contains(&"SIDECAR_SERVICE_NAME=counter-1".to_string()));
    assert!(sidecar.env.contains(&"RATELIMITER_MAX_HITS=100".to_string()));
    assert!(sidecar
        .env
        .contains(&"PROBES_LIVENESS_URL=http://counter-1:8080/healthz".to_string()));

    let app = &state.created[1];
    assert!(app
        .env
        .contains(&"HTTP_PROXY=http://counter-1-sidecar:8080".to_string()));
    drop(state);

    let (status, containers) = get(deployer.addr, "/containers").await;
    assert_eq!(status, StatusCode::OK);
    assert!(containers.get("counter-1").is_some());
    assert!(containers.get("counter-2").is_some());
    assert_eq!(containers["counter-1"]["status"], "initializing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_apply_rolls_back_on_replica_failure() {
    // Call 3 is the second replica's sidecar.
    let deployer = start_deployer(Some(3)).await;

    let (status, body) = post(deployer.addr, "/apply", MANIFEST).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("failed to deploy service replica 2"));

    // Everything this apply created is gone, including the partial pair.
    let state = deployer.runtime.state.lock();
    for name in ["counter-1", "counter-1-sidecar", "counter-2", "counter-2-sidecar"] {
        assert!(
            state.removed.contains(&name.to_string()),
            "{name} not removed"
        );
    }
    drop(state);

    let (_, containers) = get(deployer.addr, "/containers").await;
    assert_eq!(containers, serde_json::json!({}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_apply_rejects_bad_manifests() {
    let deployer = start_deployer(None).await;

    let (status, _) = post(deployer.addr, "/apply", "not yaml: [").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_image = "kind: Service\nmetadata:\n  name: a\nspec: {}\n";
    let (status, body) = post(deployer.addr, "/apply", missing_image).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "name and image are required");

    let zero_replicas =
        "kind: Service\nmetadata:\n  name: a\nspec:\n  image: img\n  replicas: 0\n";
    let (status, body) = post(deployer.addr, "/apply", zero_replicas).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "replicas must be at least 1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint() {
    let deployer = start_deployer(None).await;

    let (status, body) = get(deployer.addr, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_probe_reports_drive_restart() {
    let deployer = start_deployer(None).await;

    let (status, _) = post(deployer.addr, "/apply", MANIFEST).await;
    assert_eq!(status, StatusCode::CREATED);

    let report = r#"{"container_name":"counter-1","probe_name":"liveness","status":"unhealthy"}"#;
    for _ in 0..3 {
        let (status, _) = post(deployer.addr, "/probe-report", report).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    // Next periodic pass restarts the container once and resets the counter.
    deployer.reconciler.sweep_at(1_000_000).await;

    assert_eq!(
        deployer.runtime.state.lock().restarted,
        vec!["counter-1".to_string()]
    );

    let (status, states) = get(deployer.addr, "/health-states").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(states["counter-1"]["restarts"], 1);
    assert_eq!(states["counter-1"]["liveness_fails"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_probe_report_malformed() {
    let deployer = start_deployer(None).await;

    let (status, _) = post(deployer.addr, "/probe-report", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_and_remove_service() {
    let deployer = start_deployer(None).await;

    let (status, _) = post(deployer.addr, "/apply", MANIFEST).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post(deployer.addr, "/containers/stop", r#"{"name":"counter"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let (_, containers) = get(deployer.addr, "/containers").await;
    assert_eq!(containers["counter-1"]["status"], "stopped");

    let (status, body) =
        post(deployer.addr, "/containers/remove", r#"{"name":"counter"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "removed");

    let (_, containers) = get(deployer.addr, "/containers").await;
    assert_eq!(containers, serde_json::json!({}));

    // The ids handed out by the fake runtime were force-removed.
    let state = deployer.runtime.state.lock();
    assert!(state.removed.iter().any(|n| n.starts_with("id-")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_unknown_service() {
    let deployer = start_deployer(None).await;

    let (status, body) = post(deployer.addr, "/containers/stop", r#"{"name":"ghost"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "service not found");

    let (status, body) = post(deployer.addr, "/containers/stop", r#"{"name":""}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "name is required");
}
