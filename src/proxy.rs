use crate::error::{json_error_response, Error, ProxyErrorCode};
use crate::registry::InstanceRegistry;
use crate::transport::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Picks the proxy name for an inbound request
#[derive(Debug, Clone, Default)]
pub struct Router {
    /// Lower-cased hostname to proxy name
    routes: HashMap<String, String>,
    default_proxy: Option<String>,
}

impl Router {
    pub fn new(routes: HashMap<String, String>, default_proxy: Option<String>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(host, name)| (host.to_lowercase(), name))
                .collect(),
            default_proxy,
        }
    }

    /// Proxy name for `hostname`, falling back to the default proxy
    pub fn route(&self, hostname: Option<&str>) -> Option<&str> {
        hostname
            .and_then(|h| self.routes.get(h))
            .or(self.default_proxy.as_ref())
            .map(String::as_str)
    }
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<InstanceRegistry>,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<InstanceRegistry>,
        router: Router,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            router: Arc::new(router),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let router = Arc::clone(&self.router);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    registry: Arc<InstanceRegistry>,
    router: Arc<Router>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let router = Arc::clone(&router);
        async move { handle_request(req, registry, router, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<InstanceRegistry>,
    router: Arc<Router>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let mut req = req.map(|body| body.boxed());

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let hostname = extract_hostname(&req);
    let name = match router.route(hostname.as_deref()) {
        Some(name) => name,
        None => {
            debug!(hostname = ?hostname, request_id, "No proxy route for request");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownProxy,
                "No proxy configured for this host",
            ));
        }
    };

    debug!(
        proxy = name,
        client = %client_addr,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Incoming request"
    );

    let instance = match registry.make(name) {
        Ok(instance) => instance,
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(proxy = name, error = %e, "Failed to obtain proxy instance");
            let message = match e {
                Error::UnknownProxy(_) => "Unknown proxy",
                _ => "Proxy unavailable",
            };
            return Ok(json_error_response(e.code(), message));
        }
    };

    let mut response = instance.serve(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }

    debug!(proxy = name, status = response.status().as_u16(), request_id, "Request completed");
    Ok(response)
}

/// Hostname from the Host header or the URI authority (HTTP/2), lower-cased
/// and without port. Invalid hostnames yield `None`.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Validate characters: alphanumeric, hyphen, and dot only
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}
