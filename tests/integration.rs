//! Integration tests for Proxyhub

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use proxyhub::config::{Config, ProxyConfig};
use proxyhub::error::Error;
use proxyhub::instance::ProxyInstance;
use proxyhub::proxy::{ProxyServer, Router};
use proxyhub::registry::InstanceRegistry;
use proxyhub::transport::ProxyBody;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const OK_BODY: &str = r#"{"code":0,"msg":"ok"}"#;

/// A request as the backend received it
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

/// In-process upstream that records requests. `/slow` answers after 3 seconds,
/// requests with a body get it echoed back, everything else gets `OK_BODY`.
struct Backend {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Backend {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = Arc::clone(&recorded);
                        async move { handle_backend(req, recorded).await }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, seen }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn requests(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }
}

async fn handle_backend(
    req: Request<Incoming>,
    recorded: Arc<Mutex<Vec<Seen>>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if parts.uri.path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    recorded.lock().push(Seen {
        method: parts.method.to_string(),
        path: path.clone(),
        headers: parts.headers.clone(),
        body: body.clone(),
    });

    let reply = if body.is_empty() {
        Bytes::from_static(OK_BODY.as_bytes())
    } else {
        body
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("x-rt-foo", "foo")
        .header("x-rt-bar", "bar")
        .header("x-path", path)
        .body(Full::new(reply))
        .expect("valid response builder"))
}

fn body(chunk: &'static str) -> ProxyBody {
    let body: BoxBody<Bytes, hyper::Error> =
        Full::new(Bytes::from_static(chunk.as_bytes())).map_err(|never| match never {}).boxed();
    body
}

fn get(path: &str) -> Request<ProxyBody> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-foo", "foo")
        .header("x-bar", "bar")
        .body(body(""))
        .unwrap()
}

async fn read_body(resp: Response<ProxyBody>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Send HTTP request with custom Host header (for server testing)
async fn http_get_with_host(
    addr: SocketAddr,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

// ============================================================================
// Instance Tests
// ============================================================================

#[tokio::test]
async fn test_header_allow_lists() {
    let backend = Backend::start().await;
    let proxy = ProxyInstance::build(
        ProxyConfig::new(&backend.url())
            .with_request_headers(["x-foo"])
            .with_response_headers(["x-rt-foo"]),
    )
    .unwrap();

    let resp = proxy.serve(get("/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-rt-foo").unwrap(), "foo");
    assert!(resp.headers().get("x-rt-bar").is_none());
    assert_eq!(read_body(resp).await, OK_BODY);

    let seen = backend.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].headers.get("x-foo").unwrap(), "foo");
    assert!(seen[0].headers.get("x-bar").is_none());
    assert_eq!(
        seen[0].headers.get("host").unwrap().to_str().unwrap(),
        backend.addr.to_string()
    );
}

#[tokio::test]
async fn test_request_hook_sets_header() {
    let backend = Backend::start().await;
    let proxy = Arc::new(ProxyInstance::build(ProxyConfig::new(&backend.url())).unwrap())
        .with_request_hook(|req| {
            req.headers_mut()
                .insert("x-foo", HeaderValue::from_static("hooked"));
        });

    let resp = proxy.serve(get("/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_body(resp).await, OK_BODY);

    let seen = backend.requests();
    assert_eq!(seen[0].headers.get("x-foo").unwrap(), "hooked");
}

#[tokio::test]
async fn test_response_hook_sets_header() {
    let backend = Backend::start().await;
    let proxy = Arc::new(ProxyInstance::build(ProxyConfig::new(&backend.url())).unwrap())
        .with_response_hook(|resp| {
            resp.headers_mut()
                .insert("x-rt-extra", HeaderValue::from_static("foo"));
            Ok(())
        });

    let resp = proxy.serve(get("/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-rt-extra").unwrap(), "foo");
    assert_eq!(read_body(resp).await, OK_BODY);
}

#[tokio::test]
async fn test_failing_response_hook_is_not_relayed() {
    let backend = Backend::start().await;
    let proxy = Arc::new(ProxyInstance::build(ProxyConfig::new(&backend.url())).unwrap())
        .with_response_hook(|_resp| Err("upstream payload rejected".into()));

    let resp = proxy.serve(get("/")).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.headers().get("x-proxy-error").unwrap(),
        "RESPONSE_HOOK_FAILED"
    );
    assert_ne!(read_body(resp).await, OK_BODY);

    // The upstream was contacted
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn test_path_mapping() {
    let backend = Backend::start().await;
    let override_url = format!("{}/absolute/target", backend.url());
    let proxy = ProxyInstance::build(
        ProxyConfig::new(&backend.url())
            .with_mapping("old", "/new")
            .with_mapping("elsewhere", &override_url),
    )
    .unwrap();

    let resp = proxy.serve(get("/old")).await;
    assert_eq!(resp.headers().get("x-path").unwrap(), "/new");

    let resp = proxy.serve(get("/elsewhere")).await;
    assert_eq!(resp.headers().get("x-path").unwrap(), "/absolute/target");

    let resp = proxy.serve(get("/untouched?q=1")).await;
    assert_eq!(resp.headers().get("x-path").unwrap(), "/untouched?q=1");
}

#[tokio::test]
async fn test_request_body_is_streamed_through() {
    let backend = Backend::start().await;
    let proxy = ProxyInstance::build(ProxyConfig::new(&backend.url())).unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .body(body("hello upstream"))
        .unwrap();

    let resp = proxy.serve(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(read_body(resp).await, "hello upstream");

    let seen = backend.requests();
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].path, "/echo");
    assert_eq!(&seen[0].body[..], b"hello upstream");
}

#[tokio::test]
async fn test_timeout_from_config() {
    let backend = Backend::start().await;
    let proxy =
        ProxyInstance::build(ProxyConfig::new(&backend.url()).with_timeout_secs(1)).unwrap();

    let err = proxy.forward(get("/slow")).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamTimeout));

    let resp = proxy.serve(get("/slow")).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let proxy = ProxyInstance::build(ProxyConfig::new(&format!("http://{}", addr))).unwrap();
    let resp = proxy.serve(get("/")).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.headers().get("x-proxy-error").unwrap(),
        "CONNECTION_FAILED"
    );
}

// ============================================================================
// Registry Tests
// ============================================================================

#[tokio::test]
async fn test_registry_instances_share_nothing_but_config() {
    let backend = Backend::start().await;
    let mut configs = HashMap::new();
    configs.insert(
        "api".to_string(),
        ProxyConfig::new(&backend.url()).with_request_headers(["x-foo"]),
    );
    let registry = InstanceRegistry::new(configs);

    let base = registry.make("api").unwrap();
    let hooked = base.with_request_hook(|req| {
        req.headers_mut()
            .insert("x-hooked", HeaderValue::from_static("1"));
    });

    base.serve(get("/")).await;
    hooked.serve(get("/")).await;

    let seen = backend.requests();
    assert!(seen[0].headers.get("x-hooked").is_none());
    assert_eq!(seen[1].headers.get("x-hooked").unwrap(), "1");

    // The cached instance is still the hook-free one
    let again = registry.make("api").unwrap();
    assert!(Arc::ptr_eq(&base, &again));
    assert_eq!(again.request_hook_count(), 0);
}

#[tokio::test]
async fn test_registry_concurrent_make() {
    let mut configs = HashMap::new();
    configs.insert("api".to_string(), ProxyConfig::new("http://127.0.0.1:1"));
    let registry = Arc::new(InstanceRegistry::new(configs));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.make("api").unwrap() })
        })
        .collect();

    let mut instances = Vec::new();
    for task in tasks {
        instances.push(task.await.unwrap());
    }

    assert_eq!(registry.built_count(), 1);
    assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_config_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[server]
port = 18080
default_proxy = "api"

[proxies.api]
host = "http://127.0.0.1:3000"
keepRequestHeaders = ["x-foo"]
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.server.port, 18080);

    let registry = InstanceRegistry::from_config(&config);
    let api = registry.make("api").unwrap();
    assert_eq!(api.config().keep_request_headers, vec!["x-foo"]);
}

#[test]
fn test_config_load_rejects_bad_host() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[proxies.api]
host = "127.0.0.1:3000"
"#,
    )
    .unwrap();

    let err = Config::load(&path).unwrap_err().to_string();
    assert!(err.contains("Proxy 'api'"));
}

// ============================================================================
// Server Tests
// ============================================================================

#[tokio::test]
async fn test_server_routes_by_host() {
    let backend = Backend::start().await;

    let mut configs = HashMap::new();
    configs.insert(
        "api".to_string(),
        ProxyConfig::new(&backend.url()).with_response_headers(["x-path", "content-length"]),
    );
    let registry = Arc::new(InstanceRegistry::new(configs));

    let mut routes = HashMap::new();
    routes.insert("api.example.com".to_string(), "api".to_string());
    routes.insert("ghost.example.com".to_string(), "ghost".to_string());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(addr, registry, Router::new(routes, None), shutdown_rx);
    let handle = tokio::spawn(server.run_with_listener(listener));

    let response = http_get_with_host(addr, "/hello", "api.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("x-path: /hello"));
    assert!(response.contains("x-request-id:"));
    assert!(!response.contains("x-rt-bar"));
    assert!(response.ends_with(OK_BODY));

    let response = http_get_with_host(addr, "/", "unknown.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(response.contains("UNKNOWN_PROXY"));

    let response = http_get_with_host(addr, "/", "ghost.example.com").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    assert!(response.contains("UNKNOWN_PROXY"));

    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}
