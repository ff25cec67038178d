//! Connection pool for upstream HTTP connections
//!
//! This module provides connection pooling for efficient reuse of HTTP connections
//! to upstream servers, reducing latency and resource usage. Upstreams may be
//! plain `http://` or `https://`; TLS server certificates are checked against
//! the webpki root store.

use crate::error::{Error, Result};
use crate::transport::{ProxyBody, Transport};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Requests that ended in a transport error or timeout
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    /// Record a regular request
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upper bound for one round trip, `None` for unlimited
    pub request_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: None,
        }
    }
}

/// A connection pool for HTTP connections to upstream servers
pub struct ConnectionPool {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.map(|t| t.as_secs()),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request through the pooled client. The request URI must be absolute.
    pub async fn send_request(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        self.stats.record_request();

        let request = self.client.request(req);
        let result = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(result) => result.map_err(|e| Error::Upstream(e.to_string())),
                Err(_) => Err(Error::UpstreamTimeout),
            },
            None => request.await.map_err(|e| Error::Upstream(e.to_string())),
        };

        match result {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transport for ConnectionPool {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        self.send_request(req).await
    }
}
