use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use meshkit::listener::HttpListener;
use meshkit::registry::ControlPlane;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

async fn start_plane() -> (std::net::SocketAddr, broadcast::Sender<()>) {
    let plane = ControlPlane::new();
    let listener = HttpListener::bind("127.0.0.1:0", plane, Duration::from_secs(1))
        .await
        .unwrap();
    let addr = listener.local_addr();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = listener.serve(shutdown_rx).await;
    });

    (addr, shutdown_tx)
}

async fn start_upstream(reply: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_task = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            let seen = Arc::clone(&seen_task);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(req.uri().to_string());
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .body(reply.to_string())
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    (addr.to_string(), seen)
}

fn http_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn register(
    plane: std::net::SocketAddr,
    name: &str,
    address: &str,
) -> Response<hyper::body::Incoming> {
    let body = format!("{{\"name\":\"{name}\",\"address\":\"{address}\"}}");
    let req = Request::builder()
        .method(http::Method::POST)
        .uri(format!("http://{plane}/register"))
        .body(Full::new(Bytes::from(body)))
        .unwrap();

    http_client().request(req).await.unwrap()
}

async fn discover_address(plane: std::net::SocketAddr, service: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .uri(format!("http://{plane}/discover?service={service}"))
        .body(Full::new(Bytes::new()))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();

    if status != StatusCode::OK {
        return (status, String::new());
    }

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    (status, parsed["address"].as_str().unwrap().to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_register_and_discover_round_robin() {
    let (plane, _shutdown) = start_plane().await;

    assert_eq!(
        register(plane, "counter", "counter-1-sidecar:8080").await.status(),
        StatusCode::OK
    );
    assert_eq!(
        register(plane, "counter", "counter-2-sidecar:8080").await.status(),
        StatusCode::OK
    );

    let (_, first) = discover_address(plane, "counter").await;
    let (_, second) = discover_address(plane, "counter").await;
    let (_, third) = discover_address(plane, "counter").await;

    assert_eq!(first, "counter-1-sidecar:8080");
    assert_eq!(second, "counter-2-sidecar:8080");
    assert_eq!(third, "counter-1-sidecar:8080");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discover_unknown_service() {
    let (plane, _shutdown) = start_plane().await;

    let (status, _) = discover_address(plane, "ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discover_requires_service_param() {
    let (plane, _shutdown) = start_plane().await;

    let req = Request::builder()
        .uri(format!("http://{plane}/discover"))
        .body(Full::new(Bytes::new()))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_register_malformed_body() {
    let (plane, _shutdown) = start_plane().await;

    let req = Request::builder()
        .method(http::Method::POST)
        .uri(format!("http://{plane}/register"))
        .body(Full::new(Bytes::from_static(b"not json")))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_reverse_proxy() {
    let (plane, _shutdown) = start_plane().await;
    let (upstream_addr, seen) = start_upstream("proxied").await;

    register(plane, "counter", &upstream_addr).await;

    let req = Request::builder()
        .uri(format!("http://{plane}/api/v?x=1"))
        .header(header::HOST, "counter.localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"proxied");

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec!["/v?x=1".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_proxy_unknown_service() {
    let (plane, _shutdown) = start_plane().await;

    let req = Request::builder()
        .uri(format!("http://{plane}/api/v"))
        .header(header::HOST, "ghost.localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let resp = http_client().request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}
