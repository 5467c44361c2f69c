//! TCP listener with graceful shutdown support.
//!
//! One generic listener serves every HTTP surface in the mesh: the wrapped
//! handler is any cloneable `tower::Service` over hyper requests.

use crate::error::{MeshError, Result};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// Response body type used by every handler in the crate.
pub type HandlerBody = BoxBody<Bytes, hyper::Error>;

/// Peer address of the connection a request arrived on, injected into
/// request extensions by the listener.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

/// Extracts the client IP of a request: the first `X-Forwarded-For` entry
/// when present, otherwise the peer address of the connection.
pub fn client_ip<B>(req: &Request<B>) -> String {
    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }

    match req.extensions().get::<PeerAddr>() {
        Some(PeerAddr(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Builds a response body from a chunk of bytes.
pub fn full_body(data: impl Into<Bytes>) -> HandlerBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// HTTP/1.1 listener that accepts connections and spawns handler tasks.
///
/// Supports graceful shutdown via a broadcast channel.
pub struct HttpListener<S> {
    tcp_listener: TcpListener,
    service: S,
    addr: SocketAddr,
    read_header_timeout: Duration,
}

impl<S> HttpListener<S>
where
    S: Service<Request<Incoming>, Response = Response<HandlerBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(service, read_header_timeout))]
    pub async fn bind(addr: &str, service: S, read_header_timeout: Duration) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| MeshError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            service,
            addr: local_addr,
            read_header_timeout,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let service = self.service.clone();
                            let header_timeout = self.read_header_timeout;
                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, service, header_timeout).await
                                {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single TCP connection using HTTP/1.1.
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        service: S,
        read_header_timeout: Duration,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |mut req: Request<Incoming>| {
            let mut service = service.clone();
            req.extensions_mut().insert(PeerAddr(peer_addr));
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(read_header_timeout)
            .serve_connection(io, service)
            .await
            .map_err(MeshError::Http)
    }
}
