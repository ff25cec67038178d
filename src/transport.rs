//! Forwarding engine
//!
//! [`ReverseProxy`] drives one request/response exchange against a
//! [`Transport`]. Callers customise the exchange through a [`Rewrite`], which
//! is invoked on the outbound request just before it is sent and on the
//! upstream response just after it arrives.

use crate::error::{json_error_response, Error, HookError, ProxyErrorCode, Result};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, TE};
use hyper::{Request, Response, Version};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Body type flowing through the proxy in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Performs a full request/response round trip with an upstream
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>>;
}

/// Extension points installed into a single exchange
pub trait Rewrite: Send + Sync {
    /// Mutate the outbound request before it is sent. Cannot fail.
    fn rewrite_request(&self, req: &mut Request<ProxyBody>);

    /// Mutate the upstream response before it is relayed. An error aborts the
    /// relay of this response.
    fn rewrite_response(&self, resp: &mut Response<ProxyBody>) -> std::result::Result<(), HookError>;
}

/// Runs exchanges against a shared transport
#[derive(Clone)]
pub struct ReverseProxy {
    transport: Arc<dyn Transport>,
}

impl ReverseProxy {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Forward `req` upstream, returning the rewritten upstream response or the
    /// error that ended the exchange.
    pub async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        rewrite: &dyn Rewrite,
    ) -> Result<Response<ProxyBody>> {
        rewrite.rewrite_request(&mut req);
        remove_hop_by_hop_headers(req.headers_mut());
        *req.version_mut() = Version::HTTP_11;

        debug!(method = %req.method(), uri = %req.uri(), "Sending request upstream");

        let mut resp = self.transport.round_trip(req).await?;
        remove_hop_by_hop_headers(resp.headers_mut());

        rewrite
            .rewrite_response(&mut resp)
            .map_err(Error::ResponseHookFailed)?;

        Ok(resp)
    }

    /// Like [`forward`](Self::forward), but turns a failed exchange into an
    /// error response for the caller.
    pub async fn serve(&self, req: Request<ProxyBody>, rewrite: &dyn Rewrite) -> Response<ProxyBody> {
        match self.forward(req, rewrite).await {
            Ok(resp) => resp,
            Err(e) => error_response(&e),
        }
    }
}

/// Map an exchange error to the response relayed to the caller
pub fn error_response(err: &Error) -> Response<ProxyBody> {
    // Log detailed error internally, return generic message externally
    match err {
        Error::ResponseHookFailed(_) => {
            warn!(error = %err, "Upstream response rejected by hook");
            json_error_response(err.code(), "Upstream response rejected")
        }
        Error::UpstreamTimeout => {
            warn!(error = %err, "Upstream request timed out");
            json_error_response(err.code(), "Upstream request timed out")
        }
        Error::Upstream(_) => {
            error!(error = %err, "Failed to forward request");
            json_error_response(err.code(), "Failed to connect to upstream")
        }
        _ => {
            error!(error = %err, "Exchange failed");
            json_error_response(ProxyErrorCode::InternalError, "Proxy error")
        }
    }
}

/// Strip hop-by-hop headers, including any named by the Connection header.
/// `TE: trailers` is the only TE value kept.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let keep_te = headers
        .get(TE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("trailers"))
        .unwrap_or(false);
    if !keep_te {
        headers.remove(TE);
    }
}
