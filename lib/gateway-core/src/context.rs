//! Per-request context threaded through a policy chain
//!
//! A [`RequestContext`] is created for each inbound request before any
//! policy runs and dropped when the response has been written. Policies use
//! it to read request data, rewrite the request that will be forwarded,
//! store scratch values for later policies and register response hooks.

use crate::error::EvalError;
use crate::expression::{Expression, Scope, Template};
use crate::response::GatewayResponse;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Uri};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use url::form_urlencoded;
use uuid::Uuid;

/// Transformation applied to the backend response before it is written
///
/// Hooks are registered by policies that run before the proxy stage and are
/// invoked by the proxy stage in registration order.
pub trait ResponseHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_response(&self, context: &RequestContext, response: &mut GatewayResponse);
}

pub struct RequestContext {
    request_id: Uuid,
    started_at: Instant,
    remote_addr: Option<SocketAddr>,
    protocol: &'static str,
    original_uri: Uri,
    /// Request method forwarded to the backend
    pub method: Method,
    /// Path forwarded to the backend (rewritable)
    pub path: String,
    /// Request headers forwarded to the backend (rewritable)
    pub headers: HeaderMap,
    body: Bytes,
    /// Parameters captured by the matched API endpoint pattern
    pub params: BTreeMap<String, String>,
    pub api_endpoint: Option<String>,
    /// Literal prefix of the matched API endpoint path, removed by `stripPath`
    pub route_prefix: String,
    pub pipeline: Option<String>,
    /// Scratch values shared between policies of one chain
    pub vars: Map<String, Value>,
    /// Throttle groups this request has been tagged with
    pub throttle_groups: BTreeSet<String>,
    /// Backend chosen by the proxy stage, for access logging
    pub target: Option<String>,
    response_hooks: Vec<Arc<dyn ResponseHook>>,
}

impl RequestContext {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started_at: Instant::now(),
            remote_addr: None,
            protocol: "http",
            path: uri.path().to_string(),
            original_uri: uri,
            method,
            headers,
            body,
            params: BTreeMap::new(),
            api_endpoint: None,
            route_prefix: String::new(),
            pipeline: None,
            vars: Map::new(),
            throttle_groups: BTreeSet::new(),
            target: None,
            response_hooks: Vec::new(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// The URI as received, unaffected by rewrites
    pub fn original_uri(&self) -> &Uri {
        &self.original_uri
    }

    pub fn query_string(&self) -> Option<&str> {
        self.original_uri.query()
    }

    /// Path plus query string of the request to forward
    pub fn forward_path_and_query(&self) -> String {
        match self.query_string() {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Host name from the `Host` header (or URI authority), without port
    pub fn hostname(&self) -> Option<String> {
        let raw = self
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.original_uri.host().map(str::to_string))?;
        Some(strip_port(&raw).to_ascii_lowercase())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self) -> BTreeMap<String, String> {
        self.query_string().map(parse_query).unwrap_or_default()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Replace the buffered request body and fix up framing headers
    pub fn set_body(&mut self, body: Bytes) {
        self.headers.remove(TRANSFER_ENCODING);
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = body;
    }

    pub fn is_json(&self) -> bool {
        self.header(CONTENT_TYPE.as_str())
            .map(|v| v.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }

    /// Request body parsed as JSON, if it is JSON
    pub fn json_body(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Evaluate an expression against this context
    ///
    /// Fails with a typed [`EvalError`] instead of yielding `null` when the
    /// expression cannot be evaluated.
    pub fn run(&self, expression: &str) -> Result<Value, EvalError> {
        Expression::parse(expression)?.evaluate(self)
    }

    pub fn evaluate(&self, expression: &Expression) -> Result<Value, EvalError> {
        expression.evaluate(self)
    }

    /// Interpolate `${expression}` segments of `template`
    pub fn evaluate_as_template_string(&self, template: &str) -> Result<String, EvalError> {
        Template::parse(template)?.render(self)
    }

    pub fn render(&self, template: &Template) -> Result<String, EvalError> {
        template.render(self)
    }

    pub fn add_response_hook(&mut self, hook: Arc<dyn ResponseHook>) {
        self.response_hooks.push(hook);
    }

    pub fn response_hook_count(&self) -> usize {
        self.response_hooks.len()
    }

    /// Run and consume the registered response hooks, in registration order
    pub fn apply_response_hooks(&mut self, response: &mut GatewayResponse) {
        let hooks = std::mem::take(&mut self.response_hooks);
        for hook in &hooks {
            tracing::debug!(hook = hook.name(), "Applying response hook");
            hook.on_response(self, response);
        }
    }

    fn request_member(&self, member: &str) -> Value {
        match member {
            "method" => Value::String(self.method.to_string()),
            "url" | "originalUrl" => Value::String(
                self.original_uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| self.original_uri.path().to_string()),
            ),
            "path" => Value::String(self.path.clone()),
            "hostname" | "host" => self.hostname().map(Value::String).unwrap_or(Value::Null),
            "ip" => self
                .remote_addr
                .map(|a| Value::String(a.ip().to_string()))
                .unwrap_or(Value::Null),
            "protocol" => Value::String(self.protocol.to_string()),
            "headers" => {
                let mut headers = Map::new();
                for (name, value) in &self.headers {
                    if let Ok(value) = value.to_str() {
                        headers
                            .entry(name.as_str().to_string())
                            .or_insert_with(|| Value::String(value.to_string()));
                    }
                }
                Value::Object(headers)
            }
            "query" => string_map(self.query()),
            "params" => string_map(self.params.clone()),
            "body" => {
                if self.body.is_empty() {
                    Value::Null
                } else {
                    self.json_body().unwrap_or_else(|| {
                        Value::String(String::from_utf8_lossy(&self.body).into_owned())
                    })
                }
            }
            _ => Value::Null,
        }
    }

    fn gateway_member(&self, member: &str) -> Value {
        let optional = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
        match member {
            "requestId" => Value::String(self.request_id.to_string()),
            "apiEndpoint" => optional(&self.api_endpoint),
            "pipeline" => optional(&self.pipeline),
            "target" => optional(&self.target),
            "throttleGroups" => Value::Array(
                self.throttle_groups
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
            "req" => self.object(REQUEST_MEMBERS, Self::request_member),
            "vars" => Value::Object(self.vars.clone()),
            _ => Value::Null,
        }
    }

    fn object(&self, members: &[&str], get: fn(&Self, &str) -> Value) -> Value {
        Value::Object(
            members
                .iter()
                .map(|m| (m.to_string(), get(self, m)))
                .collect(),
        )
    }
}

const REQUEST_MEMBERS: &[&str] = &[
    "method", "url", "path", "hostname", "ip", "protocol", "headers", "query", "params", "body",
];

const GATEWAY_MEMBERS: &[&str] = &[
    "requestId",
    "apiEndpoint",
    "pipeline",
    "target",
    "throttleGroups",
];

impl Scope for RequestContext {
    fn lookup(&self, root: &str, member: Option<&str>) -> Result<Value, EvalError> {
        match (root, member) {
            ("req", Some(m)) => Ok(self.request_member(m)),
            ("req", None) => Ok(self.object(REQUEST_MEMBERS, Self::request_member)),
            ("egContext", Some(m)) => Ok(self.gateway_member(m)),
            ("egContext", None) => Ok(self.object(GATEWAY_MEMBERS, Self::gateway_member)),
            ("vars", Some(m)) => Ok(self.vars.get(m).cloned().unwrap_or(Value::Null)),
            ("vars", None) => Ok(Value::Object(self.vars.clone())),
            (other, _) => Err(EvalError::UnknownIdentifier(other.to_string())),
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("api_endpoint", &self.api_endpoint)
            .field("pipeline", &self.pipeline)
            .field("response_hooks", &self.response_hooks.len())
            .finish()
    }
}

fn string_map(map: BTreeMap<String, String>) -> Value {
    Value::Object(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return host.find(']').map(|end| &host[..=end]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

/// Parse an `application/x-www-form-urlencoded` query string; first value wins
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("API.example.com:8080"));
        headers.insert("x-user", HeaderValue::from_static("alice"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        RequestContext::new(
            Method::POST,
            "/users/42?verbose=1&name=a%20b&flag".parse().unwrap(),
            headers,
            Bytes::from_static(b"{\"amount\": 10, \"tags\": [\"x\"]}"),
        )
        .with_remote_addr("10.1.2.3:5555".parse().unwrap())
    }

    #[test]
    fn test_request_fields() {
        let ctx = context();
        assert_eq!(ctx.hostname().as_deref(), Some("api.example.com"));
        assert_eq!(ctx.run("req.method").unwrap(), json!("POST"));
        assert_eq!(ctx.run("req.url").unwrap(), json!("/users/42?verbose=1&name=a%20b&flag"));
        assert_eq!(ctx.run("req.path").unwrap(), json!("/users/42"));
        assert_eq!(ctx.run("req.ip").unwrap(), json!("10.1.2.3"));
        assert_eq!(ctx.run("req.headers.x-user").unwrap(), json!("alice"));
        assert_eq!(ctx.run("req.query.name").unwrap(), json!("a b"));
        assert_eq!(ctx.run("req.query.flag").unwrap(), json!(""));
        assert_eq!(ctx.run("req.body.amount + 5").unwrap(), json!(15));
        assert_eq!(ctx.run("req.body.tags[0]").unwrap(), json!("x"));
    }

    #[test]
    fn test_params_vars_and_gateway_fields() {
        let mut ctx = context();
        ctx.params.insert("id".to_string(), "42".to_string());
        ctx.vars.insert("tier".to_string(), json!("gold"));
        ctx.pipeline = Some("users".to_string());
        assert_eq!(ctx.run("req.params.id == 42").unwrap(), json!(true));
        assert_eq!(ctx.run("vars.tier").unwrap(), json!("gold"));
        assert_eq!(ctx.run("egContext.pipeline").unwrap(), json!("users"));
        assert_eq!(ctx.run("egContext.req.method").unwrap(), json!("POST"));
        assert_eq!(
            ctx.run("egContext.requestId").unwrap(),
            json!(ctx.request_id().to_string())
        );
    }

    #[test]
    fn test_template_string() {
        let ctx = context();
        assert_eq!(
            ctx.evaluate_as_template_string("${req.ip}/${req.headers.x-user}").unwrap(),
            "10.1.2.3/alice"
        );
        assert!(matches!(
            ctx.evaluate_as_template_string("${nope.x}"),
            Err(EvalError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn test_non_json_body_is_exposed_as_string() {
        let ctx = RequestContext::new(
            Method::POST,
            "/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::from_static(b"plain text"),
        );
        assert_eq!(ctx.run("req.body").unwrap(), json!("plain text"));
        assert_eq!(ctx.run("req.ip").unwrap(), Value::Null);
    }

    #[test]
    fn test_set_body_updates_content_length() {
        let mut ctx = context();
        ctx.set_body(Bytes::from_static(b"{}"));
        assert_eq!(ctx.header("content-length"), Some("2"));
        assert_eq!(ctx.json_body(), Some(json!({})));
    }

    #[test]
    fn test_forward_path_keeps_query() {
        let mut ctx = context();
        ctx.path = "/v2/users/42".to_string();
        assert_eq!(
            ctx.forward_path_and_query(),
            "/v2/users/42?verbose=1&name=a%20b&flag"
        );
        assert_eq!(ctx.original_uri().path(), "/users/42");
    }

    struct AddHeader(&'static str);

    impl ResponseHook for AddHeader {
        fn name(&self) -> &'static str {
            "add-header"
        }

        fn on_response(&self, _context: &RequestContext, response: &mut GatewayResponse) {
            response
                .headers
                .append("x-hook", HeaderValue::from_static(self.0));
        }
    }

    #[test]
    fn test_response_hooks_run_in_order_once() {
        let mut ctx = context();
        ctx.add_response_hook(Arc::new(AddHeader("first")));
        ctx.add_response_hook(Arc::new(AddHeader("second")));
        assert_eq!(ctx.response_hook_count(), 2);

        let mut response = GatewayResponse::new(hyper::StatusCode::OK);
        ctx.apply_response_hooks(&mut response);
        let values: Vec<&str> = response
            .headers
            .get_all("x-hook")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["first", "second"]);
        assert_eq!(ctx.response_hook_count(), 0);
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("a=1&b=x+y&a=2&c=%41%zz");
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("x y"));
        assert_eq!(params.get("c").map(String::as_str), Some("A%zz"));
    }

    #[test]
    fn test_parse_query_decoding() {
        let params = parse_query("name=J%C3%BCrgen&empty=&flag&bad=%E2%82&&");
        assert_eq!(params.get("name").map(String::as_str), Some("Jürgen"));
        assert_eq!(params.get("empty").map(String::as_str), Some(""));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert_eq!(params.get("bad").map(String::as_str), Some("\u{FFFD}"));
        assert_eq!(params.len(), 4);
    }
}
