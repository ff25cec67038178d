//! Proxy instances
//!
//! A [`ProxyInstance`] is built from one [`ProxyConfig`] and is shared
//! read-only by every exchange that uses it. For each exchange it resolves the
//! upstream URL, filters headers through the allow-lists and runs the
//! registered hooks around the forwarding step.
//!
//! Header filtering always runs before the hooks of the same direction, so
//! hooks see the filtered header set and may add headers that are not on the
//! allow-list.

use crate::config::{has_http_scheme, ProxyConfig};
use crate::error::{parse_url_error_response, Error, HookError, Result};
use crate::headers::HeaderAllowList;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::transport::{ProxyBody, ReverseProxy, Rewrite, Transport};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutates the outbound request before it is sent upstream
pub type RequestHook = Arc<dyn Fn(&mut Request<ProxyBody>) + Send + Sync>;

/// Mutates the upstream response before it is relayed; an error aborts the exchange
pub type ResponseHook =
    Arc<dyn Fn(&mut Response<ProxyBody>) -> std::result::Result<(), HookError> + Send + Sync>;

#[derive(Clone)]
pub struct ProxyInstance {
    config: Arc<ProxyConfig>,
    keep_request_headers: HeaderAllowList,
    keep_response_headers: HeaderAllowList,
    request_hooks: Vec<RequestHook>,
    response_hooks: Vec<ResponseHook>,
    proxy: ReverseProxy,
}

impl ProxyInstance {
    /// Build an instance with its own connection pool. The pool's request
    /// timeout comes from the configuration.
    pub fn build(config: impl Into<Arc<ProxyConfig>>) -> Result<Self> {
        Self::build_with_pool_config(config, PoolConfig::default())
    }

    /// Build an instance with its own pool using `pool` settings. The
    /// configuration's timeout replaces `pool.request_timeout`.
    pub fn build_with_pool_config(config: impl Into<Arc<ProxyConfig>>, pool: PoolConfig) -> Result<Self> {
        let config = config.into();
        let pool = ConnectionPool::new(PoolConfig {
            request_timeout: config.request_timeout(),
            ..pool
        });
        Self::build_with_transport(config, Arc::new(pool))
    }

    /// Build an instance that forwards through `transport`
    pub fn build_with_transport(
        config: impl Into<Arc<ProxyConfig>>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let config = config.into();
        if !config.has_valid_host() {
            return Err(Error::InvalidConfiguration {
                host: config.host.clone(),
            });
        }
        Ok(Self::from_parts(config, transport))
    }

    /// Build an instance for `host` without validating it. An empty host
    /// gives a pass-through instance that forwards to the request URI as is.
    pub fn simple(host: &str) -> Self {
        Self::from_parts(
            Arc::new(ProxyConfig::new(host)),
            Arc::new(ConnectionPool::new(PoolConfig::default())),
        )
    }

    fn from_parts(config: Arc<ProxyConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            keep_request_headers: HeaderAllowList::new(&config.keep_request_headers),
            keep_response_headers: HeaderAllowList::new(&config.keep_response_headers),
            config,
            request_hooks: Vec::new(),
            response_hooks: Vec::new(),
            proxy: ReverseProxy::new(transport),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn request_hook_count(&self) -> usize {
        self.request_hooks.len()
    }

    pub fn response_hook_count(&self) -> usize {
        self.response_hooks.len()
    }

    /// Return an instance with `hooks` appended to the request hooks.
    ///
    /// `self` is never modified. With no hooks the same instance is returned.
    pub fn with_request_hooks<I>(self: &Arc<Self>, hooks: I) -> Arc<Self>
    where
        I: IntoIterator<Item = RequestHook>,
    {
        let hooks: Vec<RequestHook> = hooks.into_iter().collect();
        if hooks.is_empty() {
            return Arc::clone(self);
        }
        let mut next = Self::clone(self);
        next.request_hooks.extend(hooks);
        Arc::new(next)
    }

    /// Return an instance with `hooks` appended to the response hooks.
    ///
    /// `self` is never modified. With no hooks the same instance is returned.
    pub fn with_response_hooks<I>(self: &Arc<Self>, hooks: I) -> Arc<Self>
    where
        I: IntoIterator<Item = ResponseHook>,
    {
        let hooks: Vec<ResponseHook> = hooks.into_iter().collect();
        if hooks.is_empty() {
            return Arc::clone(self);
        }
        let mut next = Self::clone(self);
        next.response_hooks.extend(hooks);
        Arc::new(next)
    }

    /// Append a single request hook
    pub fn with_request_hook<F>(self: &Arc<Self>, hook: F) -> Arc<Self>
    where
        F: Fn(&mut Request<ProxyBody>) + Send + Sync + 'static,
    {
        self.with_request_hooks([Arc::new(hook) as RequestHook])
    }

    /// Append a single response hook
    pub fn with_response_hook<F>(self: &Arc<Self>, hook: F) -> Arc<Self>
    where
        F: Fn(&mut Response<ProxyBody>) -> std::result::Result<(), HookError> + Send + Sync + 'static,
    {
        self.with_response_hooks([Arc::new(hook) as ResponseHook])
    }

    /// Compute the upstream URL for a request target.
    ///
    /// Mapping lookup happens once: a relative mapped path is appended to the
    /// host and is not looked up again.
    pub fn resolve(&self, request_uri: &str) -> String {
        let host = &self.config.host;
        if host.is_empty() {
            return request_uri.to_string();
        }

        let mut path = request_uri.trim_start_matches('/');
        if let Some(mapped) = self.config.mapping.get(path) {
            if has_http_scheme(mapped) {
                return mapped.clone();
            }
            path = mapped.trim_start_matches('/');
        }

        format!("{}/{}", host.trim_end_matches('/'), path)
    }

    /// Resolve and parse the upstream URL for `req`
    pub fn target_for<B>(&self, req: &Request<B>) -> Result<Uri> {
        let uri = req.uri();
        // Pass-through instances forward to whatever the caller asked for,
        // so they need the absolute form when there is one.
        let raw = if self.config.host.is_empty() {
            uri.to_string()
        } else {
            uri.path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string())
        };

        let target = self.resolve(&raw);
        match target.parse::<Uri>() {
            Ok(parsed) if parsed.host().is_some_and(|h| !h.is_empty()) => Ok(parsed),
            _ => Err(Error::MalformedTargetUrl(target)),
        }
    }

    /// Forward `req` upstream and return the upstream response, or the error
    /// that ended the exchange.
    pub async fn forward(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let target = self.target_for(&req)?;
        debug!(target = %target, method = %req.method(), "Proxying request");

        let exchange = Exchange {
            instance: self,
            target,
        };
        self.proxy.forward(req, &exchange).await
    }

    /// Handle one exchange and produce the response for the caller.
    ///
    /// A target that does not parse yields `404 parse url error` without
    /// contacting the upstream. Other failures become JSON error responses.
    pub async fn serve(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let target = match self.target_for(&req) {
            Ok(target) => target,
            Err(e) => {
                warn!(uri = %req.uri(), error = %e, "Rejecting request with unusable target");
                return parse_url_error_response();
            }
        };
        debug!(target = %target, method = %req.method(), "Proxying request");

        let exchange = Exchange {
            instance: self,
            target,
        };
        self.proxy.serve(req, &exchange).await
    }
}

impl fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("config", &self.config)
            .field("keep_request_headers", &self.keep_request_headers)
            .field("keep_response_headers", &self.keep_response_headers)
            .field("request_hooks", &self.request_hooks.len())
            .field("response_hooks", &self.response_hooks.len())
            .finish()
    }
}

/// Per-exchange state; never stored on the shared instance
struct Exchange<'a> {
    instance: &'a ProxyInstance,
    target: Uri,
}

impl Rewrite for Exchange<'_> {
    fn rewrite_request(&self, req: &mut Request<ProxyBody>) {
        *req.uri_mut() = self.target.clone();

        self.instance.keep_request_headers.retain(req.headers_mut());

        // Set after filtering so the allow-list cannot drop it
        if let Some(host) = host_header(&self.target) {
            req.headers_mut().insert(HOST, host);
        }

        for hook in &self.instance.request_hooks {
            hook(req);
        }
    }

    fn rewrite_response(&self, resp: &mut Response<ProxyBody>) -> std::result::Result<(), HookError> {
        self.instance.keep_response_headers.retain(resp.headers_mut());

        for hook in &self.instance.response_hooks {
            hook(resp)?;
        }
        Ok(())
    }
}

/// Host header value for `target`: host and port, never userinfo
fn host_header(target: &Uri) -> Option<HeaderValue> {
    let host = target.host()?;
    let value = match target.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).ok()
}
