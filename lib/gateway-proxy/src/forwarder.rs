//! Buffered request forwarding to HTTP backends

use crate::load_balancer::ServiceTarget;
use gateway_core::{GatewayResponse, RequestContext};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::debug;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Why a backend call produced no response
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Invalid upstream URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Backend request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("Backend response body failed: {0}")]
    Body(#[from] hyper::Error),

    #[error("Backend did not respond within {0:?}")]
    Timeout(Duration),
}

/// Per-call forwarding options
#[derive(Clone, Debug)]
pub struct ForwardOptions {
    /// Set `Host` to the target authority
    pub change_origin: bool,
    /// Remove the matched API endpoint prefix from the forwarded path
    pub strip_path: bool,
    pub timeout: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            change_origin: true,
            strip_path: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP request forwarder with a shared connection pool
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl RequestForwarder {
    /// `connect_timeout` bounds TCP connection setup for every backend
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client }
    }

    /// Forward the request held by `context` to `target`
    ///
    /// The whole backend response is buffered so response hooks can
    /// rewrite it before it is written to the client.
    pub async fn forward(
        &self,
        target: &ServiceTarget,
        context: &RequestContext,
        options: &ForwardOptions,
    ) -> Result<GatewayResponse, UpstreamError> {
        let path_and_query = Self::upstream_path(context, options.strip_path);
        let url = target.join(&path_and_query);
        debug!("Forwarding request to: {}", url);

        let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| {
            UpstreamError::InvalidUri {
                uri: url.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut headers = Self::filter_headers(&context.headers);
        Self::append_forwarded(&mut headers, context);
        if options.change_origin {
            if let Ok(host) = HeaderValue::from_str(target.authority().as_str()) {
                headers.insert(HOST, host);
            }
        }

        let mut request = Request::new(Full::new(context.body().clone()));
        *request.method_mut() = context.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        debug!(
            "Sending request to backend with {}ms timeout",
            options.timeout.as_millis()
        );

        let response = tokio_timeout(options.timeout, self.client.request(request))
            .await
            .map_err(|_| UpstreamError::Timeout(options.timeout))??;

        debug!("Backend responded with status: {}", response.status());

        let (parts, body) = response.into_parts();
        let body = tokio_timeout(options.timeout, body.collect())
            .await
            .map_err(|_| UpstreamError::Timeout(options.timeout))??
            .to_bytes();

        debug!("Response body size: {} bytes", body.len());

        // Content-Length stays as sent: a HEAD or 304 reply has none of the body it describes
        let mut response = GatewayResponse::new(parts.status);
        response.headers = Self::filter_headers(&parts.headers);
        response.body = body;
        Ok(response)
    }

    fn upstream_path(context: &RequestContext, strip_path: bool) -> String {
        let path = if strip_path && !context.route_prefix.is_empty() {
            match context.path.strip_prefix(context.route_prefix.as_str()) {
                Some("") => "/",
                Some(rest) if rest.starts_with('/') => rest,
                _ => context.path.as_str(),
            }
        } else {
            context.path.as_str()
        };

        match context.query_string() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        }
    }

    fn filter_headers(headers: &HeaderMap) -> HeaderMap {
        let connection_listed: Vec<String> = headers
            .get_all(hyper::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .collect();

        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let lower = name.as_str();
            if Self::is_hop_by_hop_header(lower) || connection_listed.iter().any(|c| c == lower) {
                continue;
            }
            filtered.append(name.clone(), value.clone());
        }
        filtered
    }

    fn append_forwarded(headers: &mut HeaderMap, context: &RequestContext) {
        if let Some(addr) = context.remote_addr() {
            let ip = addr.ip().to_string();
            let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip,
            };
            Self::set(headers, X_FORWARDED_FOR, &value);
        }
        if !headers.contains_key(X_FORWARDED_HOST) {
            if let Some(host) = context.header(HOST.as_str()).map(str::to_string) {
                Self::set(headers, X_FORWARDED_HOST, &host);
            }
        }
        if !headers.contains_key(X_FORWARDED_PROTO) {
            Self::set(headers, X_FORWARDED_PROTO, context.protocol());
        }
    }

    fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }

    /// Check if header is hop-by-hop (should not be forwarded)
    fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name,
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "proxy-connection"
                | "te"
                | "trailer"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn context(uri: &str, headers: &[(&'static str, &'static str)]) -> RequestContext {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        RequestContext::new(Method::GET, uri.parse().unwrap(), map, Bytes::new())
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(RequestForwarder::is_hop_by_hop_header("connection"));
        assert!(RequestForwarder::is_hop_by_hop_header("keep-alive"));
        assert!(RequestForwarder::is_hop_by_hop_header("transfer-encoding"));
        assert!(!RequestForwarder::is_hop_by_hop_header("content-type"));
        assert!(!RequestForwarder::is_hop_by_hop_header("authorization"));
    }

    #[test]
    fn test_filter_headers_drops_connection_listed() {
        let ctx = context(
            "/",
            &[
                ("connection", "close, x-private"),
                ("x-private", "secret"),
                ("x-public", "ok"),
                ("keep-alive", "timeout=5"),
            ],
        );
        let filtered = RequestForwarder::filter_headers(&ctx.headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("x-public").unwrap(), "ok");
    }

    #[test]
    fn test_upstream_path_keeps_query() {
        let ctx = context("/api/users?page=2", &[]);
        assert_eq!(RequestForwarder::upstream_path(&ctx, false), "/api/users?page=2");
    }

    #[test]
    fn test_upstream_path_strips_route_prefix() {
        let mut ctx = context("/api/users?page=2", &[]);
        ctx.route_prefix = "/api".to_string();
        assert_eq!(RequestForwarder::upstream_path(&ctx, true), "/users?page=2");

        let mut bare = context("/api", &[]);
        bare.route_prefix = "/api".to_string();
        assert_eq!(RequestForwarder::upstream_path(&bare, true), "/");

        let mut partial = context("/apis", &[]);
        partial.route_prefix = "/api".to_string();
        assert_eq!(RequestForwarder::upstream_path(&partial, true), "/apis");
    }

    #[test]
    fn test_forwarded_headers() {
        let ctx = context("/", &[("host", "gw.example.com"), ("x-forwarded-for", "10.0.0.1")])
            .with_remote_addr("192.168.1.5:4000".parse().unwrap());
        let mut headers = ctx.headers.clone();
        RequestForwarder::append_forwarded(&mut headers, &ctx);
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1, 192.168.1.5");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "gw.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_upstream_error() {
        let forwarder = RequestForwarder::new(Duration::from_millis(200));
        let target = ServiceTarget::parse("http://127.0.0.1:1").unwrap();
        let options = ForwardOptions {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let result = forwarder.forward(&target, &context("/", &[]), &options).await;
        assert!(result.is_err());
    }
}
